use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{PropertyMap, Urn};
use thiserror::Error;

/// Errors that end a run. Step failures are not errors at this level; they
/// are reported per step and aggregated into the run summary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("duplicate resource URN: {0}")]
    DuplicateUrn(Urn),

    #[error("ambiguous alias: {prior} is claimed by {}", join_urns(claimants))]
    AmbiguousAlias { prior: Urn, claimants: Vec<Urn> },

    #[error("dependency cycle between: {}", join_urns(members))]
    Cycle { members: Vec<Urn> },

    #[error("{urn} depends on {dependency}, which is not part of this deployment")]
    UnknownDependency { urn: Urn, dependency: Urn },

    #[error("no provider registered for package '{package}' (needed by {urn})")]
    UnknownProvider { urn: Urn, package: String },

    #[error("{urn} references unknown hook '{hook}'")]
    UnknownHook { urn: Urn, hook: String },

    #[error("refusing to delete protected resources: {}", join_urns(urns))]
    Protected { urns: Vec<Urn> },

    #[error("invalid goal {urn}: {reason}")]
    InvalidGoal { urn: Urn, reason: String },

    #[error("{urn} failed input validation: {}", failures.join("; "))]
    CheckFailed { urn: Urn, failures: Vec<String> },

    #[error("provider call for {urn} failed during planning: {source}")]
    Provider {
        urn: Urn,
        #[source]
        source: ProviderError,
    },

    #[error("run cancelled before execution started")]
    Cancelled,

    #[error("checkpoint persistence failed: {0}")]
    Storage(#[from] strata_storage::StorageError),
}

fn join_urns(urns: &[Urn]) -> String {
    urns.iter()
        .map(Urn::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// What a provider managed to do before a call failed.
///
/// An ID here means the resource exists even though the call reported an
/// error, so it must be recorded rather than forgotten.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialState {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{message}")]
    Failed {
        message: String,
        partial: Option<PartialState>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            partial: None,
        }
    }

    pub fn partial(&self) -> Option<&PartialState> {
        match self {
            Self::Failed { partial, .. } => partial.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum HookError {
    #[error("hook '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("unknown hook '{0}'")]
    Unknown(String),
}

impl HookError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }
}
