//! strata-storage
//!
//! Checkpoint persistence: the versioned snapshot codec and the stores a
//! checkpoint can be written to (local disk, S3, both, or memory).

pub mod client;
pub mod codec;
pub mod error;
pub mod store;

pub use crate::codec::{decode, encode, CURRENT_VERSION, SUPPORTED_FEATURES};
pub use crate::error::StorageError;
pub use crate::store::{CheckpointStore, DualStore, FileStore, MemoryStore, S3Store};
