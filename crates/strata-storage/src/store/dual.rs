use strata_core::Snapshot;

use super::{BoxFuture, CheckpointStore, FileStore, S3Store};
use crate::codec;
use crate::error::StorageError;

/// Local file first, S3 second.
///
/// The local write is authoritative: its failure fails the save. An S3
/// failure is logged and the save still succeeds, since the local copy
/// holds the checkpoint. `load` prefers S3 and falls back to the local
/// file when the object is missing or unreachable.
#[derive(Debug, Clone)]
pub struct DualStore {
    local: FileStore,
    remote: S3Store,
}

impl DualStore {
    pub fn new(local: FileStore, remote: S3Store) -> Self {
        Self { local, remote }
    }
}

impl CheckpointStore for DualStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Snapshot>, StorageError>> {
        Box::pin(async move {
            match self.remote.load().await {
                Ok(Some(snapshot)) => Ok(Some(snapshot)),
                Ok(None) => self.local.read_snapshot().await,
                // A checkpoint we cannot interpret must not be papered over
                // by an older local copy.
                Err(e @ (StorageError::UnsupportedFeatures { .. }
                | StorageError::UnsupportedVersion { .. })) => Err(e),
                Err(e) => {
                    tracing::warn!(
                        remote = %self.remote.location(),
                        error = %e,
                        "failed to load checkpoint from S3, using local copy"
                    );
                    self.local.read_snapshot().await
                }
            }
        })
    }

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let bytes = codec::encode(snapshot)?;
            self.local.write_bytes(&bytes).await?;
            if let Err(e) = self.remote.upload(bytes).await {
                tracing::warn!(
                    remote = %self.remote.location(),
                    error = %e,
                    "failed to upload checkpoint to S3 (local copy saved)"
                );
            }
            Ok(())
        })
    }

    fn location(&self) -> String {
        format!("{} + {}", self.local.location(), self.remote.location())
    }
}
