//! Version 1: inputs and outputs split, parent and protection added.

use serde::Deserialize;
use strata_core::{PropertyMap, Urn};

use super::v2;

#[derive(Debug, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub manifest: Manifest,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub time: Option<jiff::Timestamp>,
    #[serde(default)]
    pub engine_version: String,
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
}

pub fn migrate(checkpoint: Checkpoint) -> v2::Checkpoint {
    v2::Checkpoint {
        manifest: checkpoint.manifest,
        resources: checkpoint
            .resources
            .into_iter()
            .map(|r| v2::Resource {
                urn: r.urn,
                resource_type: r.resource_type,
                custom: r.custom,
                id: r.id,
                inputs: r.inputs,
                outputs: r.outputs,
                parent: r.parent,
                protect: r.protect,
                dependencies: r.dependencies,
                property_dependencies: Default::default(),
                provider: None,
                init_errors: Vec::new(),
                delete: false,
            })
            .collect(),
        pending_operations: Vec::new(),
    }
}
