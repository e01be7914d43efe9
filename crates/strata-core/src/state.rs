use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::goal::{CustomTimeouts, Goal, ProviderReference, ResourceHooks};
use crate::property::PropertyMap;
use crate::urn::Urn;

/// Post-deployment record of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub custom: bool,
    /// Provider-assigned ID; `None` for components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderReference>,
    /// Errors reported by the provider while initializing the resource. A
    /// resource with init errors exists but must be updated on the next run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_errors: Vec<String>,
    /// True for the old half of a create-before-delete replacement that has
    /// not been deleted yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retain_on_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_with: Option<Urn>,
    #[serde(default, skip_serializing_if = "CustomTimeouts::is_empty")]
    pub custom_timeouts: CustomTimeouts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: ResourceHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<jiff::Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<jiff::Timestamp>,
}

impl ResourceState {
    /// Build a state record for `goal` identified by `urn`, carrying the
    /// given provider results.
    pub fn from_goal(
        urn: Urn,
        goal: &Goal,
        id: Option<String>,
        inputs: PropertyMap,
        outputs: PropertyMap,
    ) -> Self {
        Self {
            urn,
            resource_type: goal.resource_type.clone(),
            custom: goal.custom,
            id,
            inputs,
            outputs,
            parent: goal.parent.clone(),
            protect: goal.protect,
            dependencies: goal.dependencies.clone(),
            property_dependencies: goal.property_dependencies.clone(),
            provider: goal.provider.clone(),
            init_errors: Vec::new(),
            delete: false,
            retain_on_delete: goal.retain_on_delete,
            deleted_with: goal.deleted_with.clone(),
            custom_timeouts: goal.custom_timeouts,
            additional_secret_outputs: goal.additional_secret_outputs.clone(),
            hooks: goal.hooks.clone(),
            created: None,
            modified: None,
        }
    }

    /// Provider package that manages this resource.
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

    /// Every URN this state refers to and therefore must follow in a snapshot.
    pub fn references(&self) -> Vec<&Urn> {
        let mut refs: Vec<&Urn> = Vec::new();
        let candidates = self
            .parent
            .iter()
            .chain(self.dependencies.iter())
            .chain(self.property_dependencies.values().flatten())
            .chain(self.provider.iter().filter_map(|p| p.resource.as_ref()))
            .chain(self.deleted_with.iter());
        for urn in candidates {
            if !refs.contains(&urn) {
                refs.push(urn);
            }
        }
        refs
    }

    /// True if this state depends on `urn` through any relationship.
    pub fn refers_to(&self, urn: &Urn) -> bool {
        self.references().contains(&urn)
    }
}
