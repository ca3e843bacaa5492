//! Canonical cache keys
//!
//! A canonical key is a SHA-256 digest over a stable serialization of a
//! relation's extension-producing definition: stored relations hash their
//! own identity, permissions hash their rewrite tree with same-namespace
//! relation references replaced by the referenced relation's canonical key.
//! Two relations get equal keys exactly when their definitions produce the
//! same extension regardless of unrelated schema changes, which lets cached
//! dispatch results survive schema versions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::definition::{ChildKind, NamespaceDefinition, SetOperation, UsersetRewrite};
use crate::error::{Result, SchemaError};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalKey([u8; 32]);

impl CanonicalKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalKey({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute canonical keys for every relation of a namespace.
///
/// Permissions are processed in topological order of their same-namespace
/// `computed_userset` references; the caller guarantees (via validation)
/// that permission-to-permission references are acyclic.
pub fn compute_keys(namespace: &NamespaceDefinition) -> Result<HashMap<String, CanonicalKey>> {
    let mut keys: HashMap<String, CanonicalKey> = HashMap::new();

    // Stored relations first: their extension is the stored edge set under
    // their own name, so identity is the hash input.
    for relation in &namespace.relations {
        if !relation.is_permission() {
            let mut hasher = Sha256::new();
            hasher.update(b"relation\0");
            hasher.update(namespace.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(relation.name.as_bytes());
            keys.insert(relation.name.clone(), CanonicalKey(hasher.finalize().into()));
        }
    }

    // Permissions by repeated sweeps; each sweep resolves every permission
    // whose references are already keyed. Validation rejected cycles, so
    // this terminates.
    loop {
        let mut progressed = false;
        let mut pending = 0usize;
        for relation in &namespace.relations {
            if keys.contains_key(&relation.name) {
                continue;
            }
            let rewrite = match &relation.userset_rewrite {
                Some(rewrite) => rewrite,
                None => continue,
            };
            if !references_resolved(rewrite, &keys) {
                pending += 1;
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(b"permission\0");
            hash_rewrite(rewrite, &keys, &mut hasher);
            keys.insert(relation.name.clone(), CanonicalKey(hasher.finalize().into()));
            progressed = true;
        }
        if pending == 0 {
            break;
        }
        if !progressed {
            // Unresolvable references; validation reports the precise error.
            let unresolved = namespace
                .relations
                .iter()
                .find(|r| !keys.contains_key(&r.name))
                .map(|r| r.name.clone())
                .unwrap_or_default();
            return Err(SchemaError::RewriteCycle {
                namespace: namespace.name.clone(),
                relation: unresolved,
            });
        }
    }

    Ok(keys)
}

fn references_resolved(rewrite: &UsersetRewrite, keys: &HashMap<String, CanonicalKey>) -> bool {
    rewrite.children.iter().all(|child| match &child.child {
        ChildKind::ComputedUserset { relation } => keys.contains_key(relation),
        ChildKind::TupleToUserset {
            tupleset_relation, ..
        } => keys.contains_key(tupleset_relation),
        ChildKind::Rewrite(nested) => references_resolved(nested, keys),
        ChildKind::This | ChildKind::Nil => true,
    })
}

fn hash_rewrite(rewrite: &UsersetRewrite, keys: &HashMap<String, CanonicalKey>, hasher: &mut Sha256) {
    let tag: &[u8] = match rewrite.operation {
        SetOperation::Union => b"union",
        SetOperation::Intersection => b"intersection",
        SetOperation::Exclusion => b"exclusion",
    };
    hasher.update(tag);
    hasher.update(b"(");
    for child in &rewrite.children {
        match &child.child {
            ChildKind::This => hasher.update(b"this"),
            ChildKind::Nil => hasher.update(b"nil"),
            ChildKind::ComputedUserset { relation } => {
                hasher.update(b"computed:");
                // Resolved same-namespace reference: substitute its key so
                // renames of unrelated definitions do not disturb ours.
                hasher.update(keys[relation].as_bytes());
            }
            ChildKind::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => {
                hasher.update(b"arrow:");
                hasher.update(keys[tupleset_relation].as_bytes());
                hasher.update(b"->");
                // Cross-object reference, resolvable only by name.
                hasher.update(computed_relation.as_bytes());
            }
            ChildKind::Rewrite(nested) => hash_rewrite(nested, keys, hasher),
        }
        hasher.update(b",");
    }
    hasher.update(b")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AllowedRelation, Relation};

    fn sample_namespace(extra_relation: bool) -> NamespaceDefinition {
        let mut relations = vec![
            Relation::stored("viewer", vec![AllowedRelation::plain("user")]),
            Relation::permission(
                "view",
                UsersetRewrite::union(vec![ChildKind::computed("viewer")]),
            ),
        ];
        if extra_relation {
            relations.push(Relation::stored(
                "owner",
                vec![AllowedRelation::plain("user")],
            ));
        }
        NamespaceDefinition::new("document", relations)
    }

    #[test]
    fn test_stable_across_unrelated_changes() {
        let without = compute_keys(&sample_namespace(false)).unwrap();
        let with = compute_keys(&sample_namespace(true)).unwrap();
        assert_eq!(without["view"], with["view"]);
        assert_eq!(without["viewer"], with["viewer"]);
    }

    #[test]
    fn test_distinct_definitions_distinct_keys() {
        let ns = NamespaceDefinition::new(
            "document",
            vec![
                Relation::stored("viewer", vec![AllowedRelation::plain("user")]),
                Relation::stored("owner", vec![AllowedRelation::plain("user")]),
                Relation::permission(
                    "view",
                    UsersetRewrite::union(vec![ChildKind::computed("viewer")]),
                ),
                Relation::permission(
                    "manage",
                    UsersetRewrite::union(vec![ChildKind::computed("owner")]),
                ),
            ],
        );
        let keys = compute_keys(&ns).unwrap();
        assert_ne!(keys["view"], keys["manage"]);
    }

    #[test]
    fn test_alias_shares_target_extension_shape() {
        let ns = NamespaceDefinition::new(
            "document",
            vec![
                Relation::stored("viewer", vec![AllowedRelation::plain("user")]),
                Relation::permission(
                    "view",
                    UsersetRewrite::union(vec![ChildKind::computed("viewer")]),
                ),
                Relation::permission(
                    "read",
                    UsersetRewrite::union(vec![ChildKind::computed("viewer")]),
                ),
            ],
        );
        let keys = compute_keys(&ns).unwrap();
        assert_eq!(keys["view"], keys["read"]);
    }
}
