//! Checkpoint stores.
//!
//! A store holds exactly one checkpoint per stack. `save` replaces it
//! atomically from the reader's point of view; `load` returns `None` for a
//! stack that has never been deployed.

mod dual;
mod file;
mod memory;
mod s3;

use std::future::Future;
use std::pin::Pin;

use strata_core::Snapshot;

use crate::error::StorageError;

pub use dual::DualStore;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

/// A boxed, pinned, `Send` future used by the store trait so it stays
/// object-safe without `async_trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Option<Snapshot>, StorageError>>;

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Where checkpoints go, for log lines.
    fn location(&self) -> String;
}
