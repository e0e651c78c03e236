//! Error types for dips.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Broker unreachable or the connection dropped. Retried inside the
    /// multiplexer, never handed to callers.
    #[error("broker connectivity: {0}")]
    Connectivity(String),

    /// The broker rejected a publish. The message is re-enqueued locally.
    #[error("publish rejected on {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    /// The task handler reported an application error.
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The multiplexer has been shut down and no longer accepts messages.
    #[error("channel closed: {0}")]
    Closed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Timeouts and handler failures are the two outcomes a caller may
    /// choose to tolerate; everything else is a local fault.
    pub fn is_task_outcome(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::TaskFailed { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
