use crate::error::{ModelError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relation marker for subjects referenced as plain objects rather than
/// usersets, e.g. `user:alice` instead of `group:eng#member`.
pub const ELLIPSIS: &str = "...";

/// Object id matching every object of the subject's type.
pub const WILDCARD: &str = "*";

lazy_static! {
    static ref NAMESPACE_PATTERN: Regex =
        Regex::new(r"^[a-z][a-z0-9_]{1,61}[a-z0-9]$").unwrap();
    static ref RELATION_PATTERN: Regex =
        Regex::new(r"^[a-z][a-z0-9_]{1,62}[a-z0-9]$").unwrap();
    static ref OBJECT_ID_PATTERN: Regex =
        Regex::new(r"^([a-zA-Z0-9/_|=+\-]{1,1024}|\*)$").unwrap();
}

/// A `(namespace, object_id, relation)` triple, the vertex type of the
/// relationship graph. Used both for resources (`document:readme#view`)
/// and subjects (`user:alice`, `group:eng#member`, `user:*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    /// Build a validated triple.
    pub fn new(namespace: &str, object_id: &str, relation: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        validate_object_id(object_id)?;
        validate_relation(relation)?;
        if object_id == WILDCARD && relation != ELLIPSIS {
            return Err(ModelError::WildcardWithRelation(format!(
                "{}:{}#{}",
                namespace, object_id, relation
            )));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
        })
    }

    /// Build a subject with the ellipsis relation (`user:alice`).
    pub fn object(namespace: &str, object_id: &str) -> Result<Self> {
        Self::new(namespace, object_id, ELLIPSIS)
    }

    /// Parse from `namespace:object_id` or `namespace:object_id#relation`.
    pub fn parse(s: &str) -> Result<Self> {
        let (object_part, relation) = match s.split_once('#') {
            Some((obj, rel)) => (obj, rel),
            None => (s, ELLIPSIS),
        };
        let (namespace, object_id) = object_part
            .split_once(':')
            .ok_or_else(|| ModelError::MalformedTuple(s.to_string()))?;
        Self::new(namespace, object_id, relation)
    }

    pub fn is_wildcard(&self) -> bool {
        self.object_id == WILDCARD
    }

    /// The same object with a different relation.
    pub fn with_relation(&self, relation: &str) -> Self {
        Self {
            namespace: self.namespace.clone(),
            object_id: self.object_id.clone(),
            relation: relation.to_string(),
        }
    }

    /// `namespace#relation` form used as a reachability key.
    pub fn relation_ref(&self) -> String {
        format!("{}#{}", self.namespace, self.relation)
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relation == ELLIPSIS {
            write!(f, "{}:{}", self.namespace, self.object_id)
        } else {
            write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
        }
    }
}

pub fn validate_namespace(namespace: &str) -> Result<()> {
    if NAMESPACE_PATTERN.is_match(namespace) {
        Ok(())
    } else {
        Err(ModelError::InvalidNamespace(namespace.to_string()))
    }
}

pub fn validate_relation(relation: &str) -> Result<()> {
    if relation == ELLIPSIS || RELATION_PATTERN.is_match(relation) {
        Ok(())
    } else {
        Err(ModelError::InvalidRelation(relation.to_string()))
    }
}

pub fn validate_object_id(object_id: &str) -> Result<()> {
    if OBJECT_ID_PATTERN.is_match(object_id) {
        Ok(())
    } else {
        Err(ModelError::InvalidObjectId(object_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_relation() {
        let or = ObjectAndRelation::parse("document:readme#view").unwrap();
        assert_eq!(or.namespace, "document");
        assert_eq!(or.object_id, "readme");
        assert_eq!(or.relation, "view");
    }

    #[test]
    fn test_parse_plain_object() {
        let or = ObjectAndRelation::parse("user:alice").unwrap();
        assert_eq!(or.relation, ELLIPSIS);
        assert_eq!(or.to_string(), "user:alice");
    }

    #[test]
    fn test_wildcard_subject() {
        let or = ObjectAndRelation::parse("user:*").unwrap();
        assert!(or.is_wildcard());
        assert!(ObjectAndRelation::new("user", "*", "member").is_err());
    }

    #[test]
    fn test_invalid_namespace() {
        assert!(ObjectAndRelation::parse("Document:readme#view").is_err());
        assert!(ObjectAndRelation::parse("d:readme#view").is_err());
        assert!(ObjectAndRelation::parse("readme#view").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["document:readme#view", "user:alice", "group:eng#member"] {
            assert_eq!(ObjectAndRelation::parse(s).unwrap().to_string(), s);
        }
    }
}
