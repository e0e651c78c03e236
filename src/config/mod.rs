//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The broker URL is wrapped in secrecy::SecretString since it
//! usually carries credentials.

use crate::error::{Error, Result};
use crate::mux::MuxConfig;
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// `postgres://...` for the pgmq transport, `memory://` for in-process.
    pub broker_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Capacity of each logical queue's local buffer.
    pub buffer_capacity: usize,
    /// Deliveries a process may hold per queue ahead of its workers.
    pub prefetch: usize,
    pub reconnect_delay: Duration,
    /// Number of concurrent job consumers in `serve`.
    pub job_concurrency: usize,
    /// Base directory for per-task working directories.
    pub work_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker_url: SecretString::from(required_var("DIPS_BROKER_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            buffer_capacity: parsed_var("DIPS_BUFFER_CAPACITY", 64)?,
            prefetch: parsed_var("DIPS_PREFETCH", 1)?,
            reconnect_delay: Duration::from_millis(parsed_var("DIPS_RECONNECT_DELAY_MS", 2000)?),
            job_concurrency: parsed_var("DIPS_JOB_CONCURRENCY", 4)?,
            work_dir: std::env::var("DIPS_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("dips-tasks")),
        })
    }

    /// Multiplexer settings derived from this configuration.
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            buffer_capacity: self.buffer_capacity,
            prefetch: self.prefetch,
            reconnect_delay: self.reconnect_delay,
            ..MuxConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} is malformed: {raw}"))),
        Err(_) => Ok(default),
    }
}
