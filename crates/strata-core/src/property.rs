use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::urn::Urn;

/// Key marking a JSON object as an encoded special value.
pub const SIG_KEY: &str = "__sig";

mod sig {
    pub const SECRET: &str = "secret";
    pub const COMPUTED: &str = "computed";
    pub const OUTPUT: &str = "output";
}

/// Ordered mapping of property name to value.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A typed property value.
///
/// Besides plain JSON data, a value may be marked secret, be unknown
/// (`Computed`), or refer to an output of another resource that has not been
/// resolved yet (`Output`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<PropertyValue>),
    Object(PropertyMap),
    Secret(Box<PropertyValue>),
    Computed,
    Output(OutputReference),
}

/// Reference to the output property `property` of resource `urn`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputReference {
    pub urn: Urn,
    pub property: String,
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn secret(inner: PropertyValue) -> Self {
        match inner {
            already @ Self::Secret(_) => already,
            other => Self::Secret(Box::new(other)),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed)
    }

    /// The value with any outer secret wrappers removed.
    pub fn reveal(&self) -> &PropertyValue {
        match self {
            Self::Secret(inner) => inner.reveal(),
            other => other,
        }
    }

    /// True if a secret marker appears anywhere in this value.
    pub fn contains_secrets(&self) -> bool {
        match self {
            Self::Secret(_) => true,
            Self::Array(items) => items.iter().any(Self::contains_secrets),
            Self::Object(map) => map.values().any(Self::contains_secrets),
            _ => false,
        }
    }

    /// True if an unknown or unresolved value appears anywhere in this value.
    pub fn contains_unknowns(&self) -> bool {
        match self {
            Self::Computed | Self::Output(_) => true,
            Self::Secret(inner) => inner.contains_unknowns(),
            Self::Array(items) => items.iter().any(Self::contains_unknowns),
            Self::Object(map) => map.values().any(Self::contains_unknowns),
            _ => false,
        }
    }

    /// Collect every output reference nested in this value.
    pub fn output_references<'a>(&'a self, out: &mut Vec<&'a OutputReference>) {
        match self {
            Self::Output(reference) => out.push(reference),
            Self::Secret(inner) => inner.output_references(out),
            Self::Array(items) => items.iter().for_each(|v| v.output_references(out)),
            Self::Object(map) => map.values().for_each(|v| v.output_references(out)),
            _ => {}
        }
    }

    /// Replace output references using `lookup`; unresolvable references
    /// become `Computed`.
    pub fn resolve_outputs<F>(&self, lookup: &F) -> PropertyValue
    where
        F: Fn(&OutputReference) -> Option<PropertyValue>,
    {
        match self {
            Self::Output(reference) => lookup(reference).unwrap_or(Self::Computed),
            Self::Secret(inner) => Self::secret(inner.resolve_outputs(lookup)),
            Self::Array(items) => Self::Array(items.iter().map(|v| v.resolve_outputs(lookup)).collect()),
            Self::Object(map) => Self::Object(resolve_map_outputs(map, lookup)),
            other => other.clone(),
        }
    }
}

/// Apply [`PropertyValue::resolve_outputs`] to every value of a map.
pub fn resolve_map_outputs<F>(map: &PropertyMap, lookup: &F) -> PropertyMap
where
    F: Fn(&OutputReference) -> Option<PropertyValue>,
{
    map.iter()
        .map(|(k, v)| (k.clone(), v.resolve_outputs(lookup)))
        .collect()
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(obj) => decode_object(obj),
        }
    }
}

fn decode_object(mut obj: Map<String, Value>) -> PropertyValue {
    match obj.get(SIG_KEY).and_then(Value::as_str) {
        Some(sig::SECRET) => {
            let inner = obj.remove("value").unwrap_or(Value::Null);
            PropertyValue::secret(PropertyValue::from(inner))
        }
        Some(sig::COMPUTED) => PropertyValue::Computed,
        Some(sig::OUTPUT) => {
            let urn = obj
                .get("urn")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Urn>().ok());
            let property = obj.get("property").and_then(Value::as_str);
            match (urn, property) {
                (Some(urn), Some(property)) => PropertyValue::Output(OutputReference {
                    urn,
                    property: property.to_string(),
                }),
                _ => plain_object(obj),
            }
        }
        _ => plain_object(obj),
    }
}

fn plain_object(obj: Map<String, Value>) -> PropertyValue {
    PropertyValue::Object(
        obj.into_iter()
            .map(|(k, v)| (k, PropertyValue::from(v)))
            .collect(),
    )
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Number(n) => Value::Number(n),
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            PropertyValue::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
            PropertyValue::Secret(inner) => serde_json::json!({
                SIG_KEY: sig::SECRET,
                "value": Value::from(*inner),
            }),
            PropertyValue::Computed => serde_json::json!({ SIG_KEY: sig::COMPUTED }),
            PropertyValue::Output(reference) => serde_json::json!({
                SIG_KEY: sig::OUTPUT,
                "urn": reference.urn.as_str(),
                "property": reference.property,
            }),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

// ── Property paths ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A path into a property map: `tags.env`, `rules[0].port`, or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    segments: Vec<PathSegment>,
}

impl PropertyPath {
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            segments: vec![PathSegment::Key(name.into())],
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The longest leading part of this path without wildcards. `tags.*`
    /// becomes `tags`; `*` becomes the empty path, meaning the whole map.
    pub fn concrete_prefix(&self) -> PropertyPath {
        Self {
            segments: self
                .segments
                .iter()
                .take_while(|s| **s != PathSegment::Wildcard)
                .cloned()
                .collect(),
        }
    }

    /// True if one path is a prefix of the other, i.e. a change at one
    /// location touches the other. Wildcards match any single segment.
    pub fn overlaps(&self, other: &PropertyPath) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| match (a, b) {
                (PathSegment::Wildcard, _) | (_, PathSegment::Wildcard) => true,
                (a, b) => a == b,
            })
    }

    pub fn get<'a>(&self, map: &'a PropertyMap) -> Option<&'a PropertyValue> {
        let (first, rest) = self.segments.split_first()?;
        let PathSegment::Key(key) = first else {
            return None;
        };
        let mut current = map.get(key)?;
        for segment in rest {
            current = match (current.reveal(), segment) {
                (PropertyValue::Object(obj), PathSegment::Key(k)) => obj.get(k)?,
                (PropertyValue::Array(items), PathSegment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set the value at this path, creating intermediate objects as needed.
    /// Returns false if the path crosses a non-container value.
    pub fn set(&self, map: &mut PropertyMap, value: PropertyValue) -> bool {
        let Some((PathSegment::Key(first), rest)) = self.segments.split_first() else {
            return false;
        };
        if rest.is_empty() {
            map.insert(first.clone(), value);
            return true;
        }
        let slot = map
            .entry(first.clone())
            .or_insert_with(|| PropertyValue::Object(PropertyMap::new()));
        set_in(slot, rest, value)
    }

    /// Remove the value at this path. Returns true if something was removed.
    pub fn delete(&self, map: &mut PropertyMap) -> bool {
        let Some((PathSegment::Key(first), rest)) = self.segments.split_first() else {
            return false;
        };
        if rest.is_empty() {
            return map.remove(first).is_some();
        }
        match map.get_mut(first) {
            Some(slot) => delete_in(slot, rest),
            None => false,
        }
    }
}

fn set_in(slot: &mut PropertyValue, path: &[PathSegment], value: PropertyValue) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        *slot = value;
        return true;
    };
    let target = match slot {
        PropertyValue::Secret(inner) => return set_in(inner, path, value),
        PropertyValue::Object(obj) => match segment {
            PathSegment::Key(k) => obj
                .entry(k.clone())
                .or_insert_with(|| PropertyValue::Object(PropertyMap::new())),
            _ => return false,
        },
        PropertyValue::Array(items) => match segment {
            PathSegment::Index(i) => match items.get_mut(*i) {
                Some(item) => item,
                None => return false,
            },
            _ => return false,
        },
        _ => return false,
    };
    set_in(target, rest, value)
}

fn delete_in(slot: &mut PropertyValue, path: &[PathSegment]) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        return false;
    };
    match (slot, segment) {
        (PropertyValue::Secret(inner), _) => delete_in(inner, path),
        (PropertyValue::Object(obj), PathSegment::Key(k)) => {
            if rest.is_empty() {
                obj.remove(k).is_some()
            } else {
                obj.get_mut(k).is_some_and(|next| delete_in(next, rest))
            }
        }
        (PropertyValue::Array(items), PathSegment::Index(i)) => {
            if rest.is_empty() {
                if *i < items.len() {
                    items.remove(*i);
                    true
                } else {
                    false
                }
            } else {
                items.get_mut(*i).is_some_and(|next| delete_in(next, rest))
            }
        }
        _ => false,
    }
}

impl FromStr for PropertyPath {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidPropertyPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("empty path"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (name, mut indices) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            match name {
                "" if segments.is_empty() || indices.is_empty() => {
                    return Err(invalid("empty segment"));
                }
                "" => {}
                "*" => segments.push(PathSegment::Wildcard),
                key => segments.push(PathSegment::Key(key.to_string())),
            }
            while !indices.is_empty() {
                let close = indices.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let inner = &indices[1..close];
                let segment = if inner == "*" {
                    PathSegment::Wildcard
                } else {
                    PathSegment::Index(inner.parse().map_err(|_| invalid("bad index"))?)
                };
                segments.push(segment);
                indices = &indices[close + 1..];
                if !indices.is_empty() && !indices.starts_with('[') {
                    return Err(invalid("unexpected text after ']'"));
                }
            }
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{k}")?,
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(n) => write!(f, "[{n}]")?,
                PathSegment::Wildcard if i == 0 => write!(f, "*")?,
                PathSegment::Wildcard => write!(f, ".*")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> PropertyMap {
        match PropertyValue::from(value) {
            PropertyValue::Object(m) => m,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn special_values_round_trip_through_json() {
        let urn = Urn::new("dev", "p", None, "t:m:R", "a");
        let mut props = PropertyMap::new();
        props.insert("password".into(), PropertyValue::secret("hunter2".into()));
        props.insert("arn".into(), PropertyValue::Computed);
        props.insert(
            "bucket".into(),
            PropertyValue::Output(OutputReference {
                urn,
                property: "id".into(),
            }),
        );
        props.insert("count".into(), PropertyValue::from(3_i64));

        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["password"]["__sig"], "secret");
        assert_eq!(json["count"], json!(3));

        let back: PropertyMap = serde_json::from_value(json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn malformed_output_marker_is_a_plain_object() {
        let value = PropertyValue::from(json!({"__sig": "output", "urn": "nope"}));
        assert!(matches!(value, PropertyValue::Object(_)));
    }

    #[test]
    fn secret_does_not_double_wrap() {
        let once = PropertyValue::secret("x".into());
        let twice = PropertyValue::secret(once.clone());
        assert_eq!(once, twice);
        assert_eq!(twice.reveal(), &PropertyValue::from("x"));
    }

    #[test]
    fn resolve_outputs_preserves_secrecy_and_marks_unknowns() {
        let urn = Urn::new("dev", "p", None, "t:m:R", "a");
        let known = OutputReference {
            urn: urn.clone(),
            property: "id".into(),
        };
        let unknown = OutputReference {
            urn,
            property: "missing".into(),
        };
        let value = PropertyValue::Array(vec![
            PropertyValue::Output(known.clone()),
            PropertyValue::secret(PropertyValue::Output(unknown)),
        ]);
        let resolved = value.resolve_outputs(&|r: &OutputReference| {
            (r == &known).then(|| PropertyValue::from("bucket-123"))
        });
        assert_eq!(
            resolved,
            PropertyValue::Array(vec![
                PropertyValue::from("bucket-123"),
                PropertyValue::secret(PropertyValue::Computed),
            ])
        );
        assert!(resolved.contains_unknowns());
        assert!(resolved.contains_secrets());
    }

    #[test]
    fn parses_and_displays_paths() {
        for raw in ["tags", "tags.env", "rules[0].port", "*", "a[1][2]", "a.*"] {
            let path: PropertyPath = raw.parse().unwrap();
            assert_eq!(path.to_string(), raw);
        }
        assert!("".parse::<PropertyPath>().is_err());
        assert!("a[".parse::<PropertyPath>().is_err());
        assert!("a[x]".parse::<PropertyPath>().is_err());
        assert!("a..b".parse::<PropertyPath>().is_err());
    }

    #[test]
    fn get_set_delete_nested_values() {
        let mut props = map(json!({"tags": {"env": "dev"}, "rules": [{"port": 80}]}));

        let env: PropertyPath = "tags.env".parse().unwrap();
        assert_eq!(env.get(&props), Some(&PropertyValue::from("dev")));

        let port: PropertyPath = "rules[0].port".parse().unwrap();
        assert!(port.set(&mut props, PropertyValue::from(443_i64)));
        assert_eq!(port.get(&props), Some(&PropertyValue::from(443_i64)));

        let fresh: PropertyPath = "meta.owner".parse().unwrap();
        assert!(fresh.set(&mut props, "ops".into()));
        assert_eq!(fresh.get(&props), Some(&PropertyValue::from("ops")));

        assert!(env.delete(&mut props));
        assert_eq!(env.get(&props), None);
        assert!(!env.delete(&mut props));
    }

    #[test]
    fn overlapping_paths() {
        let tags: PropertyPath = "tags".parse().unwrap();
        let env: PropertyPath = "tags.env".parse().unwrap();
        let other: PropertyPath = "name".parse().unwrap();
        let any: PropertyPath = "*".parse().unwrap();
        assert!(tags.overlaps(&env));
        assert!(env.overlaps(&tags));
        assert!(!env.overlaps(&other));
        assert!(any.overlaps(&other));
    }
}
