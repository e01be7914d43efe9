use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use strata_core::Snapshot;

use super::{BoxFuture, CheckpointStore};
use crate::codec;
use crate::error::StorageError;

/// In-process store that keeps every saved checkpoint.
///
/// Saves go through the codec so a snapshot that cannot be encoded fails
/// here the same way it would on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    current: Mutex<Option<Vec<u8>>>,
    history: Mutex<Vec<Snapshot>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `snapshot`.
    pub fn with_snapshot(snapshot: &Snapshot) -> Result<Self, StorageError> {
        let store = Self::new();
        *lock(&store.current) = Some(codec::encode(snapshot)?);
        Ok(store)
    }

    /// Make every subsequent save fail with an I/O error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Every snapshot saved so far, oldest first.
    pub fn history(&self) -> Vec<Snapshot> {
        lock(&self.history).clone()
    }

    pub fn save_count(&self) -> usize {
        lock(&self.history).len()
    }

    /// The encoded checkpoint currently held, if any.
    pub fn raw(&self) -> Option<Vec<u8>> {
        lock(&self.current).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CheckpointStore for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Snapshot>, StorageError>> {
        Box::pin(async move {
            let bytes = lock(&self.current).clone();
            bytes.map(|b| codec::decode(&b)).transpose()
        })
    }

    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other(
                    "memory store configured to fail",
                )));
            }
            let bytes = codec::encode(snapshot)?;
            *lock(&self.current) = Some(bytes);
            lock(&self.history).push(snapshot.clone());
            Ok(())
        })
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
