use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalKey;

/// An object type and its ordered relations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceDefinition {
    pub name: String,
    pub relations: Vec<Relation>,
}

impl NamespaceDefinition {
    pub fn new(name: &str, relations: Vec<Relation>) -> Self {
        Self {
            name: name.to_string(),
            relations,
        }
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// A relation on a namespace. Without a rewrite it is a *stored* relation:
/// edges are written directly against it and `type_information` enumerates
/// the admissible subject types. With a rewrite it is a *permission* whose
/// extension is computed; permissions never bear stored edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_information: Option<TypeInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userset_rewrite: Option<UsersetRewrite>,
    /// Filled at compile time when the rewrite is exactly one
    /// `computed_userset` over another relation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliasing_relation: Option<String>,
    /// Content hash identifying semantically equivalent definitions across
    /// schema versions. Filled at compile time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_cache_key: Option<CanonicalKey>,
}

impl Relation {
    /// A stored relation with the given admissible subject types.
    pub fn stored(name: &str, allowed: Vec<AllowedRelation>) -> Self {
        Self {
            name: name.to_string(),
            type_information: Some(TypeInformation {
                allowed_direct_relations: allowed,
            }),
            userset_rewrite: None,
            aliasing_relation: None,
            canonical_cache_key: None,
        }
    }

    /// A computed permission.
    pub fn permission(name: &str, rewrite: UsersetRewrite) -> Self {
        Self {
            name: name.to_string(),
            type_information: None,
            userset_rewrite: Some(rewrite),
            aliasing_relation: None,
            canonical_cache_key: None,
        }
    }

    pub fn is_permission(&self) -> bool {
        self.userset_rewrite.is_some()
    }
}

/// Admissible subject types of a stored relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TypeInformation {
    pub allowed_direct_relations: Vec<AllowedRelation>,
}

/// One admissible subject type: `user`, `group#member` or `user:*`,
/// optionally requiring a caveat on the edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedRelation {
    pub namespace: String,
    /// `None` for plain subjects (`user`), `Some` for userset subjects
    /// (`group#member`). Always `None` for wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_caveat: Option<String>,
}

impl AllowedRelation {
    pub fn plain(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: None,
            wildcard: false,
            required_caveat: None,
        }
    }

    pub fn userset(namespace: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: Some(relation.to_string()),
            wildcard: false,
            required_caveat: None,
        }
    }

    pub fn wildcard(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: None,
            wildcard: true,
            required_caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat_name: &str) -> Self {
        self.required_caveat = Some(caveat_name.to_string());
        self
    }
}

/// Set operation combining the children of a rewrite node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetOperation {
    Union,
    Intersection,
    Exclusion,
}

/// A rewrite node: a set operation over an ordered list of children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsersetRewrite {
    pub operation: SetOperation,
    pub children: Vec<RewriteChild>,
}

impl UsersetRewrite {
    pub fn union(children: Vec<ChildKind>) -> Self {
        Self::node(SetOperation::Union, children)
    }

    pub fn intersection(children: Vec<ChildKind>) -> Self {
        Self::node(SetOperation::Intersection, children)
    }

    pub fn exclusion(base: ChildKind, subtract: ChildKind) -> Self {
        Self::node(SetOperation::Exclusion, vec![base, subtract])
    }

    fn node(operation: SetOperation, children: Vec<ChildKind>) -> Self {
        Self {
            operation,
            children: children
                .into_iter()
                .map(|child| RewriteChild {
                    child,
                    operation_path: Vec::new(),
                })
                .collect(),
        }
    }
}

/// A positioned child of a rewrite node. `operation_path` is the sequence
/// of child indices from the rewrite root, assigned at compile time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteChild {
    pub child: ChildKind,
    #[serde(default)]
    pub operation_path: Vec<u32>,
}

/// The child variants of a rewrite node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    /// The direct relationships stored on the enclosing relation.
    This,
    /// Another relation on the same object.
    ComputedUserset { relation: String },
    /// Follow the tupleset relation's edges, then apply `computed_relation`
    /// on each intermediate object.
    TupleToUserset {
        tupleset_relation: String,
        computed_relation: String,
    },
    /// A nested rewrite sub-tree.
    Rewrite(Box<UsersetRewrite>),
    /// The empty set.
    Nil,
}

impl ChildKind {
    pub fn computed(relation: &str) -> Self {
        ChildKind::ComputedUserset {
            relation: relation.to_string(),
        }
    }

    pub fn arrow(tupleset_relation: &str, computed_relation: &str) -> Self {
        ChildKind::TupleToUserset {
            tupleset_relation: tupleset_relation.to_string(),
            computed_relation: computed_relation.to_string(),
        }
    }

    pub fn rewrite(rewrite: UsersetRewrite) -> Self {
        ChildKind::Rewrite(Box::new(rewrite))
    }
}
