use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use rebac_models::{CaveatDefinition, RelationshipUpdate, Revision};
use rebac_schema::NamespaceDefinition;

use crate::error::{DatastoreError, Result};
use crate::traits::{Datastore, SnapshotReader};
use crate::types::{
    FeatureSet, QueryOptions, RelationshipsFilter, RevisionCheckResult, SubjectsFilter,
    TupleIterator, WatchStream,
};

/// Severs caller cancellation from datastore work.
///
/// Every read runs on a detached task: when the calling future is dropped
/// mid-flight (a dispatch branch got cancelled, a deadline fired), the
/// underlying operation still runs to completion and the backing
/// connection comes back in a clean state. Only the current tracing span
/// is inherited, never the caller's cancellation scope.
#[derive(Clone)]
pub struct SeveredDatastore {
    inner: Arc<dyn Datastore>,
}

impl SeveredDatastore {
    pub fn new(inner: Arc<dyn Datastore>) -> Self {
        Self { inner }
    }
}

async fn detached<T, F>(operation: F) -> Result<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(operation.in_current_span())
        .await
        .map_err(|e| DatastoreError::Internal(format!("severed task failed: {}", e)))?
}

#[async_trait]
impl Datastore for SeveredDatastore {
    async fn optimized_revision(&self) -> Result<(Revision, Duration)> {
        let inner = self.inner.clone();
        detached(async move { inner.optimized_revision().await }).await
    }

    async fn head_revision(&self) -> Result<Revision> {
        let inner = self.inner.clone();
        detached(async move { inner.head_revision().await }).await
    }

    async fn check_revision(&self, revision: Revision) -> Result<RevisionCheckResult> {
        let inner = self.inner.clone();
        detached(async move { inner.check_revision(revision).await }).await
    }

    fn snapshot(&self, revision: Revision) -> Arc<dyn SnapshotReader> {
        Arc::new(SeveredReader {
            inner: self.inner.snapshot(revision),
        })
    }

    async fn read_write_tx(&self, updates: Vec<RelationshipUpdate>) -> Result<Revision> {
        let inner = self.inner.clone();
        detached(async move { inner.read_write_tx(updates).await }).await
    }

    fn watch(&self, after: Revision) -> WatchStream {
        self.inner.watch(after)
    }

    fn features(&self) -> FeatureSet {
        self.inner.features()
    }
}

struct SeveredReader {
    inner: Arc<dyn SnapshotReader>,
}

#[async_trait]
impl SnapshotReader for SeveredReader {
    async fn namespace_by_name(&self, name: &str) -> Result<Option<NamespaceDefinition>> {
        let inner = self.inner.clone();
        let name = name.to_string();
        detached(async move { inner.namespace_by_name(&name).await }).await
    }

    async fn caveat_by_name(&self, name: &str) -> Result<Option<CaveatDefinition>> {
        let inner = self.inner.clone();
        let name = name.to_string();
        detached(async move { inner.caveat_by_name(&name).await }).await
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceDefinition>> {
        let inner = self.inner.clone();
        detached(async move { inner.list_namespaces().await }).await
    }

    async fn list_caveats(&self) -> Result<Vec<CaveatDefinition>> {
        let inner = self.inner.clone();
        detached(async move { inner.list_caveats().await }).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<NamespaceDefinition>> {
        let inner = self.inner.clone();
        let names = names.to_vec();
        detached(async move { inner.lookup_namespaces_with_names(&names).await }).await
    }

    async fn lookup_caveats_with_names(&self, names: &[String]) -> Result<Vec<CaveatDefinition>> {
        let inner = self.inner.clone();
        let names = names.to_vec();
        detached(async move { inner.lookup_caveats_with_names(&names).await }).await
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator> {
        let inner = self.inner.clone();
        let filter = filter.clone();
        let options = options.clone();
        detached(async move { inner.query_relationships(&filter, &options).await }).await
    }

    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator> {
        let inner = self.inner.clone();
        let filter = filter.clone();
        let options = options.clone();
        detached(async move { inner.reverse_query_relationships(&filter, &options).await }).await
    }
}
