//! Version 2: pending operations, property dependencies, providers, init
//! errors and the pending-deletion flag.
//!
//! The provider is a bare package name; an explicit provider resource, if
//! any, follows it after `::`.

use std::collections::BTreeMap;

use serde::Deserialize;
use strata_core::{
    CustomTimeouts, Manifest, PendingOperation, PropertyMap, ProviderReference, ResourceState,
    Snapshot, Urn,
};

use super::v1;

#[derive(Debug, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub manifest: v1::Manifest,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub pending_operations: Vec<PendingOperation>,
}

#[derive(Debug, Deserialize)]
pub struct Resource {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub custom: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
    #[serde(default)]
    pub parent: Option<Urn>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    #[serde(default)]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub init_errors: Vec<String>,
    #[serde(default)]
    pub delete: bool,
}

fn provider_reference(raw: &str) -> ProviderReference {
    match raw.split_once("::") {
        Some((package, resource)) => ProviderReference {
            package: package.to_string(),
            resource: resource.parse().ok(),
        },
        None => ProviderReference::package(raw),
    }
}

/// Lift a v2 checkpoint into the current layout. Lifecycle options added
/// in v3 take their defaults.
pub fn migrate(checkpoint: Checkpoint) -> Snapshot {
    Snapshot {
        manifest: Manifest {
            time: checkpoint.manifest.time,
            engine_version: checkpoint.manifest.engine_version,
        },
        resources: checkpoint
            .resources
            .into_iter()
            .map(|r| ResourceState {
                urn: r.urn,
                resource_type: r.resource_type,
                custom: r.custom,
                id: r.id,
                inputs: r.inputs,
                outputs: r.outputs,
                parent: r.parent,
                protect: r.protect,
                dependencies: r.dependencies,
                property_dependencies: r.property_dependencies,
                provider: r.provider.as_deref().map(provider_reference),
                init_errors: r.init_errors,
                delete: r.delete,
                retain_on_delete: false,
                deleted_with: None,
                custom_timeouts: CustomTimeouts::default(),
                additional_secret_outputs: Vec::new(),
                hooks: BTreeMap::new(),
                created: None,
                modified: None,
            })
            .collect(),
        pending_operations: checkpoint.pending_operations,
    }
}
