//! Versioned checkpoint codec.
//!
//! A checkpoint on disk is an envelope `{version, features?, checkpoint}`.
//! Decoding dispatches on `version` to the matching historical layout and
//! migrates it forward one version at a time until it reaches the current
//! in-memory [`Snapshot`]. Encoding always writes the current version.
//!
//! Versions at or above 4 may declare `features`. A feature is declared
//! whenever the checkpoint relies on semantics an engine that ignores the
//! corresponding fields would get wrong, so decoding refuses any feature
//! name it does not know.

mod v0;
mod v1;
mod v2;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strata_core::Snapshot;

use crate::error::StorageError;

pub const CURRENT_VERSION: u32 = 4;

pub mod feature {
    pub const DELETED_WITH: &str = "deleted-with";
    pub const RESOURCE_HOOKS: &str = "resource-hooks";
    pub const RETAIN_ON_DELETE: &str = "retain-on-delete";
}

pub const SUPPORTED_FEATURES: &[&str] = &[
    feature::DELETED_WITH,
    feature::RESOURCE_HOOKS,
    feature::RETAIN_ON_DELETE,
];

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    features: Option<Vec<String>>,
    checkpoint: serde_json::Value,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    features: Vec<&'static str>,
    checkpoint: &'a Snapshot,
}

/// Decode a checkpoint of any supported version into the current snapshot
/// layout.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, StorageError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;

    if envelope.version > CURRENT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            version: envelope.version,
            current: CURRENT_VERSION,
        });
    }

    if let Some(features) = &envelope.features {
        let unknown: BTreeSet<&str> = features
            .iter()
            .map(String::as_str)
            .filter(|f| !SUPPORTED_FEATURES.contains(f))
            .collect();
        if !unknown.is_empty() {
            return Err(StorageError::UnsupportedFeatures {
                features: unknown.into_iter().map(str::to_string).collect(),
            });
        }
    }

    let snapshot = match envelope.version {
        0 => {
            let checkpoint: v0::Checkpoint = serde_json::from_value(envelope.checkpoint)?;
            v2::migrate(v1::migrate(v0::migrate(checkpoint)))
        }
        1 => {
            let checkpoint: v1::Checkpoint = serde_json::from_value(envelope.checkpoint)?;
            v2::migrate(v1::migrate(checkpoint))
        }
        2 => {
            let checkpoint: v2::Checkpoint = serde_json::from_value(envelope.checkpoint)?;
            v2::migrate(checkpoint)
        }
        // v3 and v4 share a layout; v4 adds envelope features.
        _ => serde_json::from_value::<Snapshot>(envelope.checkpoint)?,
    };

    snapshot.integrity_check()?;
    tracing::debug!(
        version = envelope.version,
        resources = snapshot.resources.len(),
        "decoded checkpoint"
    );
    Ok(snapshot)
}

/// Encode a snapshot as a current-version checkpoint.
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
    let envelope = EnvelopeRef {
        version: CURRENT_VERSION,
        features: required_features(snapshot),
        checkpoint: snapshot,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Features a reader must understand to interpret `snapshot` correctly.
pub fn required_features(snapshot: &Snapshot) -> Vec<&'static str> {
    let mut features = BTreeSet::new();
    for resource in &snapshot.resources {
        if resource.deleted_with.is_some() {
            features.insert(feature::DELETED_WITH);
        }
        if !resource.hooks.is_empty() {
            features.insert(feature::RESOURCE_HOOKS);
        }
        if resource.retain_on_delete {
            features.insert(feature::RETAIN_ON_DELETE);
        }
    }
    features.into_iter().collect()
}
