use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const PREFIX: &str = "urn:strata:";
const SEPARATOR: &str = "::";
const TYPE_DELIMITER: char = '$';

/// Globally unique, stable identifier of a resource.
///
/// Layout: `urn:strata:<stack>::<project>::<qualified-type>::<name>`. The
/// qualified type is the parent's qualified type joined to the resource type
/// with `$`, so moving a resource under a different parent changes its URN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Build the URN for a resource registered under `parent`.
    ///
    /// A parent that is itself a root stack resource (its qualified type has
    /// no `$` and its type ends in `:Stack`) does not contribute to the
    /// qualified type.
    pub fn new(
        stack: &str,
        project: &str,
        parent: Option<&Urn>,
        resource_type: &str,
        name: &str,
    ) -> Self {
        let qualified_type = match parent {
            Some(parent) if !parent.is_root_stack() => {
                format!("{}{TYPE_DELIMITER}{resource_type}", parent.qualified_type())
            }
            _ => resource_type.to_string(),
        };
        Self(format!(
            "{PREFIX}{stack}{SEPARATOR}{project}{SEPARATOR}{qualified_type}{SEPARATOR}{name}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn stack(&self) -> &str {
        self.part(0)
    }

    pub fn project(&self) -> &str {
        self.part(1)
    }

    /// The full `$`-joined type chain, e.g. `my:Component$aws:s3:Bucket`.
    pub fn qualified_type(&self) -> &str {
        self.part(2)
    }

    /// The resource's own type token (last element of the qualified type).
    pub fn resource_type(&self) -> &str {
        let qualified = self.qualified_type();
        qualified
            .rsplit(TYPE_DELIMITER)
            .next()
            .unwrap_or(qualified)
    }

    pub fn name(&self) -> &str {
        // The name is everything after the third separator; names may
        // themselves contain "::".
        let body = &self.0[PREFIX.len()..];
        body.splitn(4, SEPARATOR).nth(3).unwrap_or_default()
    }

    fn part(&self, index: usize) -> &str {
        let body = &self.0[PREFIX.len()..];
        body.splitn(4, SEPARATOR).nth(index).unwrap_or_default()
    }

    fn is_root_stack(&self) -> bool {
        !self.qualified_type().contains(TYPE_DELIMITER) && self.resource_type().ends_with(":Stack")
    }

    fn parse(raw: String) -> Result<Self, CoreError> {
        let Some(body) = raw.strip_prefix(PREFIX) else {
            return Err(CoreError::InvalidUrn {
                urn: raw,
                reason: format!("missing '{PREFIX}' prefix"),
            });
        };
        let parts: Vec<&str> = body.splitn(4, SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(CoreError::InvalidUrn {
                urn: raw,
                reason: "expected <stack>::<project>::<type>::<name>".to_string(),
            });
        }
        if parts[2].is_empty() || parts[3].is_empty() {
            return Err(CoreError::InvalidUrn {
                urn: raw,
                reason: "type and name must not be empty".to_string(),
            });
        }
        Ok(Self(raw))
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.to_string())
    }
}

impl TryFrom<String> for Urn {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resource_urn() {
        let urn = Urn::new("dev", "web", None, "aws:s3:Bucket", "assets");
        assert_eq!(urn.as_str(), "urn:strata:dev::web::aws:s3:Bucket::assets");
        assert_eq!(urn.stack(), "dev");
        assert_eq!(urn.project(), "web");
        assert_eq!(urn.resource_type(), "aws:s3:Bucket");
        assert_eq!(urn.name(), "assets");
    }

    #[test]
    fn child_urn_carries_parent_type_chain() {
        let parent = Urn::new("dev", "web", None, "acme:Site", "site");
        let child = Urn::new("dev", "web", Some(&parent), "aws:s3:Bucket", "assets");
        assert_eq!(child.qualified_type(), "acme:Site$aws:s3:Bucket");
        assert_eq!(child.resource_type(), "aws:s3:Bucket");

        let grandchild = Urn::new("dev", "web", Some(&child), "aws:s3:Object", "index");
        assert_eq!(
            grandchild.qualified_type(),
            "acme:Site$aws:s3:Bucket$aws:s3:Object"
        );
    }

    #[test]
    fn stack_parent_is_not_part_of_the_type_chain() {
        let stack = Urn::new("dev", "web", None, "strata:strata:Stack", "web-dev");
        let child = Urn::new("dev", "web", Some(&stack), "aws:s3:Bucket", "assets");
        assert_eq!(child.qualified_type(), "aws:s3:Bucket");
    }

    #[test]
    fn names_may_contain_separators() {
        let urn: Urn = "urn:strata:dev::web::t:m:R::a::b".parse().unwrap();
        assert_eq!(urn.name(), "a::b");
    }

    #[test]
    fn rejects_malformed() {
        assert!("urn:other:dev::web::t::n".parse::<Urn>().is_err());
        assert!("urn:strata:dev::web".parse::<Urn>().is_err());
        assert!("urn:strata:dev::web::::n".parse::<Urn>().is_err());
    }

    #[test]
    fn serde_round_trip_is_a_plain_string() {
        let urn = Urn::new("dev", "web", None, "t:m:R", "r1");
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, "\"urn:strata:dev::web::t:m:R::r1\"");
        let back: Urn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);
    }
}
