//! Version 0: one property bag per resource, no parent or protection.

use serde::Deserialize;
use strata_core::{PropertyMap, Urn};

use super::v1;

#[derive(Debug, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub time: Option<jiff::Timestamp>,
    #[serde(default)]
    pub resources: Vec<Resource>,
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
    pub properties: PropertyMap,
    #[serde(default)]
    pub dependencies: Vec<Urn>,
}

/// A v0 bag held both the declared inputs and the provider's outputs; it is
/// the best available value for each.
pub fn migrate(checkpoint: Checkpoint) -> v1::Checkpoint {
    v1::Checkpoint {
        manifest: v1::Manifest {
            time: checkpoint.time,
            engine_version: String::new(),
        },
        resources: checkpoint
            .resources
            .into_iter()
            .map(|r| v1::Resource {
                urn: r.urn,
                resource_type: r.resource_type,
                custom: r.custom,
                id: r.id,
                inputs: r.properties.clone(),
                outputs: r.properties,
                parent: None,
                protect: false,
                dependencies: r.dependencies,
            })
            .collect(),
    }
}
