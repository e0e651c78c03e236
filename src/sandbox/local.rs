//! Per-task working directory on the local disk.
//!
//! Only `file://` URLs are staged; any other scheme is reported as
//! unsupported so an object-store backed implementation can slot in
//! behind the same trait.

use super::Filesystem;
use crate::error::{Error, Result};
use crate::model::TaskId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

const INPUTS: &str = "inputs";
const OUTPUTS: &str = "outputs";

#[derive(Debug)]
pub struct LocalFilesystem {
    root: PathBuf,
    /// (local path, destination) pairs pushed on flush.
    outputs: Vec<(PathBuf, PathBuf)>,
    closed: bool,
}

impl LocalFilesystem {
    /// Create `<base_dir>/<task_id>` with its inputs and outputs folders.
    pub async fn create(base_dir: &Path, task_id: TaskId) -> Result<Self> {
        let root = base_dir.join(task_id.to_string());
        tokio::fs::create_dir_all(root.join(INPUTS)).await?;
        tokio::fs::create_dir_all(root.join(OUTPUTS)).await?;
        debug!(path = %root.display(), "task working directory created");
        Ok(Self {
            root,
            outputs: Vec::new(),
            closed: false,
        })
    }

    fn local_path(url: &str) -> Result<PathBuf> {
        let parsed = Url::parse(url).map_err(|e| Error::Decode(format!("invalid url {url}: {e}")))?;
        if parsed.scheme() != "file" {
            return Err(Error::Unsupported(format!(
                "url scheme '{}' ({url})",
                parsed.scheme()
            )));
        }
        parsed
            .to_file_path()
            .map_err(|_| Error::Decode(format!("not a local file url: {url}")))
    }

    fn file_name(path: &Path, url: &str) -> Result<PathBuf> {
        path.file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Decode(format!("url has no file name: {url}")))
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn add_input(&mut self, url: &str) -> Result<PathBuf> {
        let source = Self::local_path(url)?;
        let target = self.root.join(INPUTS).join(Self::file_name(&source, url)?);
        tokio::fs::copy(&source, &target).await?;
        debug!(from = %source.display(), to = %target.display(), "input staged");
        Ok(target)
    }

    async fn add_output(&mut self, url: &str) -> Result<PathBuf> {
        let destination = Self::local_path(url)?;
        let local = self
            .root
            .join(OUTPUTS)
            .join(Self::file_name(&destination, url)?);
        self.outputs.push((local.clone(), destination));
        Ok(local)
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    async fn flush(&mut self) -> Result<()> {
        for (local, destination) in &self.outputs {
            if !tokio::fs::try_exists(local).await? {
                warn!(path = %local.display(), "declared output was not written");
                continue;
            }
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(local, destination).await?;
            debug!(to = %destination.display(), "output flushed");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(path = %self.root.display(), "task working directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
