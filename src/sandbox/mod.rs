//! Execution capabilities injected into task handlers.
//!
//! A handler never touches the host directly: it gets a [`Filesystem`]
//! rooted in a per-invocation working directory and an [`Environment`]
//! that runs commands inside it. [`ContextFactory`] builds both for each
//! request.

pub mod local;
pub mod native;

pub use local::LocalFilesystem;
pub use native::NativeEnvironment;

use crate::error::Result;
use crate::model::TaskRequest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Callback receiving one line of process output.
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Captured result of a command run through an [`Environment`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Environment: Send + Sync {
    /// Run `cmd` with `args`, streaming each output line to the matching
    /// sink as it arrives. Runs to completion; there is no cancellation.
    async fn execute(
        &self,
        cmd: &str,
        args: &[String],
        on_stdout: LineSink<'_>,
        on_stderr: LineSink<'_>,
    ) -> Result<ExecOutput>;
}

/// Task-scoped view of files. Inputs are staged in before the handler
/// uses them; outputs are pushed to their destinations on [`flush`].
///
/// [`flush`]: Filesystem::flush
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Stage `url` into the working directory and return its local path.
    async fn add_input(&mut self, url: &str) -> Result<PathBuf>;

    /// Register `url` as an output destination and return the local path
    /// the task should write to.
    async fn add_output(&mut self, url: &str) -> Result<PathBuf>;

    fn root_path(&self) -> &Path;

    /// Push every registered output to its destination.
    async fn flush(&mut self) -> Result<()>;

    /// Release the working directory.
    async fn close(&mut self) -> Result<()>;
}

/// Builds the capabilities for one task invocation.
#[async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    async fn create(
        &self,
        request: &TaskRequest,
    ) -> Result<(Box<dyn Filesystem>, Box<dyn Environment>)>;
}

/// Local working directories under `base_dir`, native process execution.
#[derive(Debug, Clone)]
pub struct LocalContextFactory {
    base_dir: PathBuf,
}

impl LocalContextFactory {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl ContextFactory for LocalContextFactory {
    async fn create(
        &self,
        request: &TaskRequest,
    ) -> Result<(Box<dyn Filesystem>, Box<dyn Environment>)> {
        let fs = LocalFilesystem::create(&self.base_dir, request.task_id).await?;
        let env = NativeEnvironment::new(fs.root_path())
            .env("DIPS_TASK_ID", request.task_id.to_string())
            .env("DIPS_SERVICE", request.service.clone())
            .env("DIPS_TASK_NAME", request.name.clone());
        Ok((Box::new(fs), Box::new(env)))
    }
}
