use crate::tuple::RelationTuple;
use serde::{Deserialize, Serialize};

/// Write semantics for a single relationship mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateOperation {
    /// Insert; fails if an edge with the same `(resource, subject)` key
    /// already exists.
    Create,
    /// Idempotent upsert; replaces the caveat of an existing edge.
    Touch,
    /// Idempotent removal.
    Delete,
}

/// One mutation in a transactional write batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub tuple: RelationTuple,
}

impl RelationshipUpdate {
    pub fn create(tuple: RelationTuple) -> Self {
        Self {
            operation: UpdateOperation::Create,
            tuple,
        }
    }

    pub fn touch(tuple: RelationTuple) -> Self {
        Self {
            operation: UpdateOperation::Touch,
            tuple,
        }
    }

    pub fn delete(tuple: RelationTuple) -> Self {
        Self {
            operation: UpdateOperation::Delete,
            tuple,
        }
    }
}
