use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use rebac_models::{CaveatExpression, ContextualizedCaveat, ObjectAndRelation, Revision};
use rebac_schema::{ResultStatus, SetOperation};

/// Outcome of a permission check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    /// The subject holds the permission.
    Member,
    /// The subject does not hold the permission.
    NotMember,
    /// Membership depends on the residual caveat expression; the caller
    /// can re-evaluate it with additional context.
    Conditional(CaveatExpression),
}

/// Evaluation counters attached to every response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchMetadata {
    pub trace_id: Uuid,
    /// Sub-problems evaluated for this request.
    pub dispatch_count: u64,
    /// Sub-problems answered from the dispatch cache.
    pub cached_dispatch_count: u64,
    /// Deepest recursion level the request actually needed.
    pub depth_required: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRequest {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub revision: Revision,
    /// Caveat parameter bindings supplied with the request.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Recursion budget; defaults to the configured maximum.
    pub depth: Option<u32>,
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

impl CheckRequest {
    pub fn new(
        resource: ObjectAndRelation,
        subject: ObjectAndRelation,
        revision: Revision,
    ) -> Self {
        Self {
            resource,
            subject,
            revision,
            context: BTreeMap::new(),
            depth: None,
            deadline: None,
        }
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResponse {
    pub membership: Membership,
    pub metadata: DispatchMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpandRequest {
    pub resource: ObjectAndRelation,
    pub revision: Revision,
    pub depth: Option<u32>,
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

impl ExpandRequest {
    pub fn new(resource: ObjectAndRelation, revision: Revision) -> Self {
        Self {
            resource,
            revision,
            depth: None,
            deadline: None,
        }
    }
}

/// The rewrite tree of a relation, materialized with concrete subject
/// sets at the leaves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExpandTree {
    Subjects {
        resource: ObjectAndRelation,
        subjects: Vec<ExpandSubject>,
    },
    Operation {
        resource: ObjectAndRelation,
        operation: SetOperation,
        children: Vec<ExpandTree>,
    },
}

impl ExpandTree {
    /// All subjects in the tree, ignoring set semantics. Useful for tests
    /// and diagnostics; permission-accurate answers come from `check`.
    pub fn flatten_subjects(&self) -> Vec<&ExpandSubject> {
        match self {
            ExpandTree::Subjects { subjects, .. } => subjects.iter().collect(),
            ExpandTree::Operation { children, .. } => children
                .iter()
                .flat_map(|child| child.flatten_subjects())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpandSubject {
    pub subject: ObjectAndRelation,
    pub caveat: Option<ContextualizedCaveat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpandResponse {
    pub tree: ExpandTree,
    pub metadata: DispatchMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupResourcesRequest {
    pub resource_type: String,
    pub permission: String,
    pub subject: ObjectAndRelation,
    pub revision: Revision,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Cap on unique resource ids emitted; defaults to the configured
    /// limit.
    pub limit: Option<usize>,
    pub depth: Option<u32>,
}

impl LookupResourcesRequest {
    pub fn new(
        resource_type: &str,
        permission: &str,
        subject: ObjectAndRelation,
        revision: Revision,
    ) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            permission: permission.to_string(),
            subject,
            revision,
            context: BTreeMap::new(),
            limit: None,
            depth: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// One resource emitted by `lookup_resources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookedUpResource {
    pub resource_id: String,
    /// Set when membership still depends on unresolved caveats.
    pub conditional: bool,
}

/// One candidate emitted by `reachable_resources`; conditional entries
/// require a follow-up check before being reported to a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReachableResource {
    pub resource_id: String,
    pub status: ResultStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupSubjectsRequest {
    /// Resource with the permission as its relation.
    pub resource: ObjectAndRelation,
    pub subject_type: String,
    pub revision: Revision,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub limit: Option<usize>,
    pub depth: Option<u32>,
}

impl LookupSubjectsRequest {
    pub fn new(resource: ObjectAndRelation, subject_type: &str, revision: Revision) -> Self {
        Self {
            resource,
            subject_type: subject_type.to_string(),
            revision,
            context: BTreeMap::new(),
            limit: None,
            depth: None,
        }
    }
}

/// One subject emitted by `lookup_subjects`. A wildcard grant surfaces as
/// the literal `*` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookedUpSubject {
    pub subject_id: String,
    pub conditional: bool,
}
