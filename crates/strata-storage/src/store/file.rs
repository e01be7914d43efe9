use std::path::{Path, PathBuf};

use strata_core::Snapshot;

use super::{BoxFuture, CheckpointStore};
use crate::codec;
use crate::error::StorageError;

/// Checkpoint kept in a single JSON file, replaced by write-then-rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write raw checkpoint bytes atomically.
    pub(crate) async fn write_bytes(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub(crate) async fn read_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(codec::decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CheckpointStore for FileStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Snapshot>, StorageError>> {
        Box::pin(self.read_snapshot())
    }

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let bytes = codec::encode(snapshot)?;
            self.write_bytes(&bytes).await?;
            tracing::debug!(path = %self.path.display(), "checkpoint saved");
            Ok(())
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
