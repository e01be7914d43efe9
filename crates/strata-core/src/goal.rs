use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::property::PropertyMap;
use crate::urn::Urn;

/// Desired state for one resource, as declared by the program being deployed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Goal {
    /// Type token, e.g. `aws:s3:Bucket`. The first `:`-separated part is the
    /// provider package.
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    /// True if backed by a provider; false for pure components.
    pub custom: bool,
    pub properties: PropertyMap,
    pub parent: Option<Urn>,
    pub protect: bool,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    pub provider: Option<ProviderReference>,
    /// `None` leaves the ordering to the provider's diff.
    pub delete_before_replace: Option<bool>,
    pub ignore_changes: Vec<String>,
    pub replace_on_changes: Vec<String>,
    pub additional_secret_outputs: Vec<String>,
    pub aliases: Vec<Urn>,
    pub custom_timeouts: CustomTimeouts,
    pub retain_on_delete: bool,
    pub deleted_with: Option<Urn>,
    pub hooks: ResourceHooks,
    /// Diagnostic provenance only.
    pub source_position: Option<String>,
}

impl Goal {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, custom: bool) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            custom,
            ..Self::default()
        }
    }

    /// Provider package for this goal: the explicit reference if present,
    /// otherwise the first segment of the type token.
    pub fn provider_package(&self) -> &str {
        match &self.provider {
            Some(reference) => &reference.package,
            None => self
                .resource_type
                .split(':')
                .next()
                .unwrap_or(&self.resource_type),
        }
    }

    /// Every URN this goal must be ordered after, deduplicated, in a stable order.
    pub fn all_dependencies(&self) -> Vec<&Urn> {
        let candidates = self
            .parent
            .iter()
            .chain(self.dependencies.iter())
            .chain(self.property_dependencies.values().flatten())
            .chain(self.provider.iter().filter_map(|p| p.resource.as_ref()))
            .chain(self.deleted_with.iter());

        let mut deps: Vec<&Urn> = Vec::new();
        for urn in candidates {
            if !deps.contains(&urn) {
                deps.push(urn);
            }
        }
        deps
    }
}

/// Reference to the provider instance responsible for a custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReference {
    pub package: String,
    /// URN of an explicit provider resource in the same program, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Urn>,
}

impl ProviderReference {
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            resource: None,
        }
    }
}

/// Per-operation time budgets, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomTimeouts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<u64>,
}

impl CustomTimeouts {
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }

    pub fn create_duration(&self) -> Option<Duration> {
        self.create.map(Duration::from_secs)
    }

    pub fn update_duration(&self) -> Option<Duration> {
        self.update.map(Duration::from_secs)
    }

    pub fn delete_duration(&self) -> Option<Duration> {
        self.delete.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

/// Named hooks attached to a resource, by lifecycle point.
pub type ResourceHooks = BTreeMap<HookType, Vec<String>>;
