//! Secret classification of resource outputs.

use std::collections::{BTreeSet, HashMap};

use strata_core::{PropertyMap, PropertyValue, Urn};

pub const MASK: &str = "[secret]";

/// Output names known to be secret per resource, for the duration of a run.
///
/// Entries only ever grow, so an output classified secret by one step stays
/// secret for every later step on the same resource.
#[derive(Debug, Default)]
pub struct SecretLedger {
    secret_outputs: HashMap<Urn, BTreeSet<String>>,
}

impl SecretLedger {
    /// Remember every output of `outputs` that is already secret.
    pub fn observe(&mut self, urn: &Urn, outputs: &PropertyMap) {
        let entry = self.secret_outputs.entry(urn.clone()).or_default();
        for (name, value) in outputs {
            if value.is_secret() {
                entry.insert(name.clone());
            }
        }
    }

    /// Wrap the outputs that must be secret: those whose input of the same
    /// name is secret, those listed in `additional`, and those recorded as
    /// secret earlier in the run.
    pub fn classify(
        &mut self,
        urn: &Urn,
        inputs: &PropertyMap,
        additional: &[String],
        outputs: PropertyMap,
    ) -> PropertyMap {
        let known = self.secret_outputs.entry(urn.clone()).or_default();
        let classified: PropertyMap = outputs
            .into_iter()
            .map(|(name, value)| {
                let secret = value.is_secret()
                    || known.contains(&name)
                    || additional.contains(&name)
                    || inputs.get(&name).is_some_and(PropertyValue::contains_secrets);
                let value = if secret {
                    PropertyValue::secret(value)
                } else {
                    value
                };
                (name, value)
            })
            .collect();
        for (name, value) in &classified {
            if value.is_secret() {
                known.insert(name.clone());
            }
        }
        classified
    }
}

/// Replace secret values with a mask, for event payloads.
pub fn mask(map: &PropertyMap) -> PropertyMap {
    map.iter()
        .map(|(k, v)| (k.clone(), mask_value(v)))
        .collect()
}

fn mask_value(value: &PropertyValue) -> PropertyValue {
    match value {
        PropertyValue::Secret(_) => PropertyValue::secret(PropertyValue::string(MASK)),
        PropertyValue::Array(items) => PropertyValue::Array(items.iter().map(mask_value).collect()),
        PropertyValue::Object(map) => PropertyValue::Object(mask(map)),
        other => other.clone(),
    }
}
