use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use rebac_models::{CaveatDefinition, RelationshipUpdate, Revision};
use rebac_schema::NamespaceDefinition;

use crate::error::Result;
use crate::types::{
    FeatureSet, QueryOptions, RelationshipsFilter, RevisionCheckResult, SubjectsFilter,
    TupleIterator, WatchStream,
};

/// Abstract storage of relationships, schema definitions and revisions.
/// Implementations provide stable revisions, snapshot-consistent readers
/// and atomic writes; everything else is the evaluation core's problem.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// A revision suitable for cache-friendly reads: recent enough to be
    /// consistent, stable enough to be shared by many requests. The
    /// returned duration is how long the revision may keep being handed
    /// out.
    async fn optimized_revision(&self) -> Result<(Revision, Duration)>;

    /// The latest committed revision.
    async fn head_revision(&self) -> Result<Revision>;

    /// Whether a previously issued revision is still usable.
    async fn check_revision(&self, revision: Revision) -> Result<RevisionCheckResult>;

    /// A consistent reader pinned at the given revision.
    fn snapshot(&self, revision: Revision) -> Arc<dyn SnapshotReader>;

    /// Apply a batch of relationship updates atomically, returning the
    /// revision at which they became visible.
    async fn read_write_tx(&self, updates: Vec<RelationshipUpdate>) -> Result<Revision>;

    /// Stream committed changes after the given revision.
    fn watch(&self, after: Revision) -> WatchStream;

    fn features(&self) -> FeatureSet;
}

/// A read-only view of the datastore at a single revision.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    async fn namespace_by_name(&self, name: &str) -> Result<Option<NamespaceDefinition>>;

    async fn caveat_by_name(&self, name: &str) -> Result<Option<CaveatDefinition>>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceDefinition>>;

    async fn list_caveats(&self) -> Result<Vec<CaveatDefinition>>;

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<NamespaceDefinition>>;

    async fn lookup_caveats_with_names(&self, names: &[String]) -> Result<Vec<CaveatDefinition>>;

    /// Relationships matched from the resource side.
    async fn query_relationships(
        &self,
        filter: &RelationshipsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator>;

    /// Relationships matched from the subject side.
    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator>;
}
