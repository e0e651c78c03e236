//! Command-backed task services declared in TOML.
//!
//! Each `.toml` file in the services directory declares one service:
//!
//! ```toml
//! [service]
//! name = "shell"
//! concurrency = 2
//! command = "/bin/sh"
//! args = ["-c", "{{ script }}"]
//! ```
//!
//! `args` are rendered against the request parameters before execution.

mod command;

pub use command::CommandHandler;

use crate::error::{Error, Result};
use crate::worker::TaskPoolConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ServiceFile {
    service: ServiceMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceMeta {
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_concurrency() -> usize {
    1
}

impl ServiceMeta {
    pub fn pool_config(&self) -> TaskPoolConfig {
        TaskPoolConfig {
            concurrency: self.concurrency,
        }
    }
}

/// Loaded service definitions, indexed by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceMeta>,
}

impl ServiceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `.toml` file in `dir`. Duplicate names are a config error.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut services = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read services dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "toml") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let file: ServiceFile = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("bad service config {}: {e}", path.display()))
            })?;
            let meta = file.service;
            if meta.concurrency == 0 {
                return Err(Error::Config(format!(
                    "service {} in {}: concurrency must be at least 1",
                    meta.name,
                    path.display()
                )));
            }
            if services.contains_key(&meta.name) {
                return Err(Error::Config(format!(
                    "service {} declared twice ({})",
                    meta.name,
                    path.display()
                )));
            }
            services.insert(meta.name.clone(), meta);
        }

        Ok(Self { services })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceMeta> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceMeta> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
