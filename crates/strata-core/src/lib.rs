//! strata-core
//!
//! Pure domain types for the reconciliation engine: URNs, property values,
//! resource goals, resource states and snapshots.
//! No I/O: this is the shared vocabulary of the Strata system.

pub mod error;
pub mod goal;
pub mod property;
pub mod snapshot;
pub mod state;
pub mod urn;

pub use crate::error::CoreError;
pub use crate::goal::{CustomTimeouts, Goal, HookType, ProviderReference, ResourceHooks};
pub use crate::property::{OutputReference, PropertyMap, PropertyPath, PropertyValue};
pub use crate::snapshot::{Manifest, OperationType, PendingOperation, Snapshot};
pub use crate::state::ResourceState;
pub use crate::urn::Urn;
