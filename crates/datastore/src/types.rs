use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use rebac_models::{RelationTuple, RelationshipUpdate, Revision};

use crate::error::DatastoreError;

/// Filter over stored relationships, matched from the resource side.
/// Unset fields match anything; `subject_ids` is a disjunction so a single
/// query can cover a concrete subject and its type wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipsFilter {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    #[serde(default)]
    pub subject_ids: Vec<String>,
    pub subject_relation: Option<String>,
    pub caveat_name: Option<String>,
}

impl RelationshipsFilter {
    pub fn for_resource(resource_type: &str, resource_id: &str, relation: &str) -> Self {
        Self {
            resource_type: Some(resource_type.to_string()),
            resource_id: Some(resource_id.to_string()),
            relation: Some(relation.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        let resource_ok = self
            .resource_type
            .as_deref()
            .map(|t| tuple.resource.namespace == t)
            .unwrap_or(true)
            && self
                .resource_id
                .as_deref()
                .map(|id| tuple.resource.object_id == id)
                .unwrap_or(true)
            && self
                .relation
                .as_deref()
                .map(|r| tuple.resource.relation == r)
                .unwrap_or(true);
        let subject_ok = self
            .subject_type
            .as_deref()
            .map(|t| tuple.subject.namespace == t)
            .unwrap_or(true)
            && (self.subject_ids.is_empty()
                || self.subject_ids.iter().any(|id| tuple.subject.object_id == *id))
            && self
                .subject_relation
                .as_deref()
                .map(|r| tuple.subject.relation == r)
                .unwrap_or(true);
        let caveat_ok = self
            .caveat_name
            .as_deref()
            .map(|name| {
                tuple
                    .caveat
                    .as_ref()
                    .map(|c| c.caveat_name == name)
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        resource_ok && subject_ok && caveat_ok
    }
}

/// Filter over stored relationships, matched from the subject side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectsFilter {
    pub subject_type: String,
    #[serde(default)]
    pub subject_ids: Vec<String>,
    /// `None` matches any subject relation.
    pub subject_relation: Option<String>,
    pub resource_type: Option<String>,
    pub relation: Option<String>,
}

impl SubjectsFilter {
    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        tuple.subject.namespace == self.subject_type
            && (self.subject_ids.is_empty()
                || self.subject_ids.iter().any(|id| tuple.subject.object_id == *id))
            && self
                .subject_relation
                .as_deref()
                .map(|r| tuple.subject.relation == r)
                .unwrap_or(true)
            && self
                .resource_type
                .as_deref()
                .map(|t| tuple.resource.namespace == t)
                .unwrap_or(true)
            && self
                .relation
                .as_deref()
                .map(|r| tuple.resource.relation == r)
                .unwrap_or(true)
    }
}

/// Result ordering for relationship queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Unsorted,
    ByResource,
    BySubject,
}

/// Resume point for paginated queries: the display form of the last tuple
/// already delivered under the chosen sort order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub after: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: SortOrder,
    pub cursor: Option<Cursor>,
}

impl QueryOptions {
    pub fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Validity of a previously issued revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionCheckResult {
    Ok,
    Stale,
    Invalid,
}

/// Capabilities advertised by a datastore implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub watch_enabled: bool,
}

/// One committed transaction, as seen by watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionChanges {
    pub revision: Revision,
    pub changes: Vec<RelationshipUpdate>,
    pub observed_at: DateTime<Utc>,
}

/// Change feed handle: a stream of committed changes and a side channel
/// for terminal errors.
pub struct WatchStream {
    pub changes: mpsc::UnboundedReceiver<RevisionChanges>,
    pub errors: mpsc::UnboundedReceiver<DatastoreError>,
}

/// A finite, forward-only batch of relationship results. The underlying
/// read completes before the iterator is handed out, so dropping it never
/// interrupts a query midway.
#[derive(Debug)]
pub struct TupleIterator {
    tuples: std::vec::IntoIter<RelationTuple>,
}

impl TupleIterator {
    pub fn new(tuples: Vec<RelationTuple>) -> Self {
        Self {
            tuples: tuples.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for TupleIterator {
    type Item = RelationTuple;

    fn next(&mut self) -> Option<RelationTuple> {
        self.tuples.next()
    }
}
