use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::state::ResourceState;
use crate::urn::Urn;

/// The full set of resource states for a stack at a point in time.
///
/// Resources are kept in topological order: every resource appears after
/// everything it refers to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub manifest: Manifest,
    pub resources: Vec<ResourceState>,
    /// Operations that were started but not finished when the snapshot was
    /// written. Non-empty only if a run was interrupted.
    #[serde(default)]
    pub pending_operations: Vec<PendingOperation>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub time: Option<jiff::Timestamp>,
    #[serde(default)]
    pub engine_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub op: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub started: jiff::Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Creating,
    Updating,
    Deleting,
    Reading,
}

impl Snapshot {
    pub fn new(resources: Vec<ResourceState>) -> Self {
        Self {
            manifest: Manifest::default(),
            resources,
            pending_operations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// The live (not pending-deletion) record for `urn`.
    pub fn get(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.urn == urn && !r.delete)
    }

    /// Verify URN uniqueness and topological order.
    ///
    /// Records flagged `delete` are the old halves of replacements and may
    /// share a URN with the live record.
    pub fn integrity_check(&self) -> Result<(), CoreError> {
        let mut seen: HashSet<&Urn> = HashSet::new();
        for resource in &self.resources {
            for dependency in resource.references() {
                if !seen.contains(dependency) {
                    return Err(CoreError::OutOfOrder {
                        urn: resource.urn.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if resource.delete {
                seen.insert(&resource.urn);
                continue;
            }
            if !seen.insert(&resource.urn)
                && self
                    .resources
                    .iter()
                    .filter(|r| r.urn == resource.urn && !r.delete)
                    .count()
                    > 1
            {
                return Err(CoreError::DuplicateResource(resource.urn.clone()));
            }
        }
        Ok(())
    }
}
