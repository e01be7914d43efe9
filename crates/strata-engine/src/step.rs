//! Planned units of work.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{Goal, PropertyMap, ResourceState, Urn};

use crate::provider::ResourceProvider;

pub type StepId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOp {
    Same,
    Create,
    Update,
    Delete,
    /// First half of a replacement: the new resource.
    CreateReplacement,
    /// Second half of a replacement: the old resource.
    DeleteReplaced,
    Read,
}

/// The logical change a step contributes to run totals. The two halves of
/// a replacement count once, as `Replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Same,
    Create,
    Update,
    Delete,
    Replace,
    Read,
}

impl StepOp {
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            Self::Same => Some(ChangeKind::Same),
            Self::Create => Some(ChangeKind::Create),
            Self::Update => Some(ChangeKind::Update),
            Self::Delete => Some(ChangeKind::Delete),
            Self::CreateReplacement => Some(ChangeKind::Replace),
            Self::DeleteReplaced => None,
            Self::Read => Some(ChangeKind::Read),
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteReplaced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// How a delete step gets rid of its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Ask the provider to delete it.
    Provider,
    /// Drop it from state only; the real resource is kept.
    Retain,
    /// Drop it from state only, once its anchor has been deleted.
    DeletedWith(Urn),
}

/// A prior resource state a step acts on, with its position in the prior
/// snapshot.
#[derive(Debug, Clone)]
pub struct OldState {
    pub index: usize,
    pub state: ResourceState,
}

pub struct Step {
    pub id: StepId,
    pub op: StepOp,
    pub urn: Urn,
    pub goal: Option<Goal>,
    pub old: Option<OldState>,
    /// Provider-checked inputs for create and update steps.
    pub inputs: PropertyMap,
    /// Changed top-level properties.
    pub diff: Vec<String>,
    pub provider: Option<Arc<dyn ResourceProvider>>,
    pub removal: Removal,
    pub delete_before_replace: bool,
    /// Position of the goal in topological order; orders the new states in
    /// the snapshot.
    pub ordinal: usize,
    pub timeout: Duration,
}

impl Step {
    pub fn metadata(&self) -> StepMetadata {
        let resource_type = match (&self.goal, &self.old) {
            (Some(goal), _) => goal.resource_type.clone(),
            (None, Some(old)) => old.state.resource_type.clone(),
            (None, None) => self.urn.resource_type().to_string(),
        };
        StepMetadata {
            op: self.op,
            urn: self.urn.clone(),
            resource_type,
            old_id: self.old.as_ref().and_then(|o| o.state.id.clone()),
            diff: self.diff.clone(),
            retain: self.removal == Removal::Retain,
        }
    }

    pub fn custom(&self) -> bool {
        match (&self.goal, &self.old) {
            (Some(goal), _) => goal.custom,
            (None, Some(old)) => old.state.custom,
            (None, None) => false,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("urn", &self.urn)
            .field("diff", &self.diff)
            .field("removal", &self.removal)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

/// Step description carried by events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub op: StepOp,
    pub urn: Urn,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retain: bool,
}
