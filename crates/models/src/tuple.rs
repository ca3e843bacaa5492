use crate::caveat::ContextualizedCaveat;
use crate::error::{ModelError, Result};
use crate::object::ObjectAndRelation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stored relationship edge: `resource@subject`, optionally carrying a
/// contextualized caveat. The uniqueness key is `(resource, subject)`; the
/// caveat is metadata on the edge, not part of its identity.
///
/// Example: `document:readme#viewer@user:alice[ip_in_range:{"cidr":"10.0.0.0/8"}]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationTuple {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub caveat: Option<ContextualizedCaveat>,
}

impl RelationTuple {
    pub fn new(resource: ObjectAndRelation, subject: ObjectAndRelation) -> Self {
        Self {
            resource,
            subject,
            caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat: ContextualizedCaveat) -> Self {
        self.caveat = Some(caveat);
        self
    }

    /// The `(resource, subject)` uniqueness key.
    pub fn key(&self) -> (ObjectAndRelation, ObjectAndRelation) {
        (self.resource.clone(), self.subject.clone())
    }

    /// Parse the display form:
    /// `ns:obj#rel@ns:obj[#rel][\[caveat\]]` or `[caveat:{json}]`.
    pub fn parse(s: &str) -> Result<Self> {
        let (edge, caveat) = match s.find('[') {
            Some(idx) => {
                let suffix = &s[idx..];
                let inner = suffix
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .ok_or_else(|| ModelError::MalformedTuple(s.to_string()))?;
                (&s[..idx], Some(parse_caveat(inner, s)?))
            }
            None => (s, None),
        };

        let (resource_part, subject_part) = edge
            .split_once('@')
            .ok_or_else(|| ModelError::MalformedTuple(s.to_string()))?;
        let resource = ObjectAndRelation::parse(resource_part)?;
        if resource.relation == crate::object::ELLIPSIS {
            return Err(ModelError::MalformedTuple(s.to_string()));
        }
        let subject = ObjectAndRelation::parse(subject_part)?;

        Ok(Self {
            resource,
            subject,
            caveat,
        })
    }
}

fn parse_caveat(inner: &str, original: &str) -> Result<ContextualizedCaveat> {
    match inner.split_once(':') {
        Some((name, ctx)) => {
            let context = serde_json::from_str(ctx)
                .map_err(|_| ModelError::MalformedTuple(original.to_string()))?;
            Ok(ContextualizedCaveat {
                caveat_name: name.to_string(),
                context,
            })
        }
        None => Ok(ContextualizedCaveat::named(inner)),
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.subject)?;
        if let Some(caveat) = &self.caveat {
            write!(f, "{}", caveat)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let tuple = RelationTuple::parse("document:readme#viewer@user:alice").unwrap();
        assert_eq!(tuple.resource.relation, "viewer");
        assert_eq!(tuple.subject.object_id, "alice");
        assert!(tuple.caveat.is_none());
    }

    #[test]
    fn test_parse_userset_subject() {
        let tuple = RelationTuple::parse("document:readme#viewer@group:eng#member").unwrap();
        assert_eq!(tuple.subject.relation, "member");
    }

    #[test]
    fn test_parse_caveated() {
        let tuple = RelationTuple::parse(
            r#"document:readme#viewer@user:alice[ip_in_range:{"cidr":"10.0.0.0/8"}]"#,
        )
        .unwrap();
        let caveat = tuple.caveat.unwrap();
        assert_eq!(caveat.caveat_name, "ip_in_range");
        assert_eq!(
            caveat.context.get("cidr"),
            Some(&serde_json::json!("10.0.0.0/8"))
        );
    }

    #[test]
    fn test_resource_requires_relation() {
        assert!(RelationTuple::parse("document:readme@user:alice").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "document:readme#viewer@user:alice",
            "document:readme#viewer@group:eng#member",
            "document:readme#viewer@user:*",
            "document:readme#viewer@user:alice[expired]",
        ] {
            assert_eq!(RelationTuple::parse(s).unwrap().to_string(), s);
        }
    }
}
