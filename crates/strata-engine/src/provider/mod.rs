//! Provider protocol.
//!
//! A provider manages the resources of one package. The engine talks to it
//! through [`ResourceProvider`], implemented once per wire protocol
//! ([`PluginProvider`] for out-of-process plugins) or directly in-process.

mod client;
mod plugin;
mod registry;

use serde::{Deserialize, Serialize};
use strata_core::{PropertyMap, Urn};

use crate::error::ProviderError;
use crate::BoxFuture;

pub use client::{Completion, ProviderClient};
pub use plugin::PluginProvider;
pub use registry::ProviderRegistry;

pub trait ResourceProvider: Send + Sync {
    /// Validate and normalize `news`. Failures are reported in the response,
    /// not as an error.
    fn check(&self, request: CheckRequest) -> BoxFuture<'_, Result<CheckResponse, ProviderError>>;

    fn diff(&self, request: DiffRequest) -> BoxFuture<'_, Result<DiffResponse, ProviderError>>;

    fn create(&self, request: CreateRequest) -> BoxFuture<'_, Result<CreateResponse, ProviderError>>;

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, Result<UpdateResponse, ProviderError>>;

    fn delete(&self, request: DeleteRequest) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Read the live state of a resource. `id: None` in the response means
    /// the resource no longer exists.
    fn read(&self, request: ReadRequest) -> BoxFuture<'_, Result<ReadResponse, ProviderError>>;

    /// Ask the provider to wind down in-flight operations.
    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

// ── Requests and responses ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub urn: Urn,
    #[serde(default)]
    pub olds: Option<PropertyMap>,
    pub news: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckResponse {
    pub inputs: PropertyMap,
    #[serde(default)]
    pub failures: Vec<CheckFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRequest {
    pub urn: Urn,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
    pub news: PropertyMap,
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffChanges {
    /// The provider could not tell; the engine compares inputs itself.
    #[default]
    Unknown,
    None,
    Some,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffResponse {
    pub changes: DiffChanges,
    /// Properties whose change requires replacement.
    pub replaces: Vec<String>,
    /// Properties guaranteed not to change.
    pub stables: Vec<String>,
    pub delete_before_replace: bool,
    /// Changed top-level properties, if the provider reports them.
    pub changed_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub urn: Urn,
    pub news: PropertyMap,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub urn: Urn,
    pub id: String,
    pub olds: PropertyMap,
    pub news: PropertyMap,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub urn: Urn,
    pub id: String,
    pub olds: PropertyMap,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub urn: Urn,
    pub id: String,
    pub inputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
}
