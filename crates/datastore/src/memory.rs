use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use rebac_models::{
    CaveatDefinition, RelationTuple, RelationshipUpdate, Revision, UpdateOperation,
};
use rebac_schema::NamespaceDefinition;

use crate::error::{DatastoreError, Result};
use crate::traits::{Datastore, SnapshotReader};
use crate::types::{
    FeatureSet, QueryOptions, RelationshipsFilter, RevisionChanges, RevisionCheckResult,
    SortOrder, SubjectsFilter, TupleIterator, WatchStream,
};

/// In-memory datastore with MVCC tuple versioning. Every committed write
/// advances a decimal revision; readers pin a revision and observe exactly
/// the writes at or below it. Used as the test backend and as the
/// reference for the contract's semantics.
#[derive(Clone)]
pub struct MemoryDatastore {
    inner: Arc<Inner>,
}

struct Inner {
    state: RwLock<State>,
    optimized_calls: AtomicUsize,
    revision_validity: Duration,
    stale_window: Option<u64>,
}

#[derive(Default)]
struct State {
    head: Revision,
    tuples: Vec<VersionedTuple>,
    schemas: Vec<SchemaVersion>,
    changelog: Vec<RevisionChanges>,
    watchers: Vec<Watcher>,
}

struct VersionedTuple {
    tuple: RelationTuple,
    created: Revision,
    deleted: Option<Revision>,
}

impl VersionedTuple {
    fn live_at(&self, revision: Revision) -> bool {
        self.created <= revision && self.deleted.map(|d| d > revision).unwrap_or(true)
    }
}

struct SchemaVersion {
    revision: Revision,
    namespaces: Arc<Vec<NamespaceDefinition>>,
    caveats: Arc<Vec<CaveatDefinition>>,
}

struct Watcher {
    changes: mpsc::UnboundedSender<RevisionChanges>,
    // Held so the paired error stream stays open for the watcher's
    // lifetime; the in-memory backend never emits on it.
    _errors: mpsc::UnboundedSender<DatastoreError>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                optimized_calls: AtomicUsize::new(0),
                revision_validity: Duration::ZERO,
                stale_window: None,
            }),
        }
    }

    /// How long handed-out optimized revisions stay valid.
    pub fn with_revision_validity(revision_validity: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                optimized_calls: AtomicUsize::new(0),
                revision_validity,
                stale_window: None,
            }),
        }
    }

    /// Treat revisions more than `window` commits behind head as
    /// garbage collected.
    pub fn with_stale_window(window: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                optimized_calls: AtomicUsize::new(0),
                revision_validity: Duration::ZERO,
                stale_window: Some(window),
            }),
        }
    }

    /// Number of optimized-revision computations performed, for asserting
    /// single-flight behavior in tests.
    pub fn optimized_revision_calls(&self) -> usize {
        self.inner.optimized_calls.load(Ordering::SeqCst)
    }

    /// Store a new schema version, visible at the returned revision.
    pub fn write_schema(
        &self,
        namespaces: Vec<NamespaceDefinition>,
        caveats: Vec<CaveatDefinition>,
    ) -> Revision {
        let mut state = self.write_state();
        let revision = state.head.next();
        state.head = revision;
        state.schemas.push(SchemaVersion {
            revision,
            namespaces: Arc::new(namespaces),
            caveats: Arc::new(caveats),
        });
        tracing::debug!("Stored schema version at revision {}", revision);
        revision
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn optimized_revision(&self) -> Result<(Revision, Duration)> {
        self.inner.optimized_calls.fetch_add(1, Ordering::SeqCst);
        let head = self.read_state().head;
        Ok((head, self.inner.revision_validity))
    }

    async fn head_revision(&self) -> Result<Revision> {
        Ok(self.read_state().head)
    }

    async fn check_revision(&self, revision: Revision) -> Result<RevisionCheckResult> {
        let head = self.read_state().head;
        if revision > head {
            return Ok(RevisionCheckResult::Invalid);
        }
        if let Some(window) = self.inner.stale_window {
            if head.value().saturating_sub(revision.value()) > window {
                return Ok(RevisionCheckResult::Stale);
            }
        }
        Ok(RevisionCheckResult::Ok)
    }

    fn snapshot(&self, revision: Revision) -> Arc<dyn SnapshotReader> {
        Arc::new(MemorySnapshotReader {
            inner: self.inner.clone(),
            revision,
        })
    }

    async fn read_write_tx(&self, updates: Vec<RelationshipUpdate>) -> Result<Revision> {
        let mut state = self.write_state();
        let revision = state.head.next();

        // Validate CREATEs against the live set before mutating anything,
        // so a failed batch leaves no partial writes behind.
        for update in &updates {
            if update.operation == UpdateOperation::Create {
                let exists = state
                    .tuples
                    .iter()
                    .any(|v| v.live_at(state.head) && v.tuple.key() == update.tuple.key());
                if exists {
                    return Err(DatastoreError::AlreadyExists(update.tuple.to_string()));
                }
            }
        }

        for update in &updates {
            match update.operation {
                UpdateOperation::Create => {
                    state.tuples.push(VersionedTuple {
                        tuple: update.tuple.clone(),
                        created: revision,
                        deleted: None,
                    });
                }
                UpdateOperation::Touch | UpdateOperation::Delete => {
                    let head = state.head;
                    let key = update.tuple.key();
                    for versioned in state.tuples.iter_mut() {
                        if versioned.live_at(head) && versioned.tuple.key() == key {
                            versioned.deleted = Some(revision);
                        }
                    }
                    if update.operation == UpdateOperation::Touch {
                        state.tuples.push(VersionedTuple {
                            tuple: update.tuple.clone(),
                            created: revision,
                            deleted: None,
                        });
                    }
                }
            }
        }

        state.head = revision;
        let entry = RevisionChanges {
            revision,
            changes: updates,
            observed_at: Utc::now(),
        };
        state.changelog.push(entry.clone());
        state
            .watchers
            .retain(|watcher| watcher.changes.send(entry.clone()).is_ok());

        tracing::debug!(
            "Committed {} relationship updates at revision {}",
            entry.changes.len(),
            revision
        );
        Ok(revision)
    }

    fn watch(&self, after: Revision) -> WatchStream {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let mut state = self.write_state();
        for entry in &state.changelog {
            if entry.revision > after {
                let _ = changes_tx.send(entry.clone());
            }
        }
        state.watchers.push(Watcher {
            changes: changes_tx,
            _errors: errors_tx,
        });
        WatchStream {
            changes: changes_rx,
            errors: errors_rx,
        }
    }

    fn features(&self) -> FeatureSet {
        FeatureSet {
            watch_enabled: true,
        }
    }
}

struct MemorySnapshotReader {
    inner: Arc<Inner>,
    revision: Revision,
}

impl MemorySnapshotReader {
    fn schema_at(&self) -> Option<(Arc<Vec<NamespaceDefinition>>, Arc<Vec<CaveatDefinition>>)> {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .schemas
            .iter()
            .rev()
            .find(|version| version.revision <= self.revision)
            .map(|version| (version.namespaces.clone(), version.caveats.clone()))
    }

    fn collect<F>(&self, matches: F, options: &QueryOptions) -> TupleIterator
    where
        F: Fn(&RelationTuple) -> bool,
    {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        let mut tuples: Vec<RelationTuple> = state
            .tuples
            .iter()
            .filter(|v| v.live_at(self.revision))
            .map(|v| &v.tuple)
            .filter(|t| matches(t))
            .cloned()
            .collect();

        match options.sort {
            SortOrder::Unsorted => {}
            SortOrder::ByResource => {
                tuples.sort_by(|a, b| (&a.resource, &a.subject).cmp(&(&b.resource, &b.subject)))
            }
            SortOrder::BySubject => {
                tuples.sort_by(|a, b| (&a.subject, &a.resource).cmp(&(&b.subject, &b.resource)))
            }
        }
        if let Some(cursor) = &options.cursor {
            if options.sort != SortOrder::Unsorted {
                tuples.retain(|t| t.to_string() > cursor.after);
            }
        }
        if let Some(limit) = options.limit {
            tuples.truncate(limit);
        }
        TupleIterator::new(tuples)
    }
}

#[async_trait]
impl SnapshotReader for MemorySnapshotReader {
    async fn namespace_by_name(&self, name: &str) -> Result<Option<NamespaceDefinition>> {
        Ok(self.schema_at().and_then(|(namespaces, _)| {
            namespaces.iter().find(|ns| ns.name == name).cloned()
        }))
    }

    async fn caveat_by_name(&self, name: &str) -> Result<Option<CaveatDefinition>> {
        Ok(self
            .schema_at()
            .and_then(|(_, caveats)| caveats.iter().find(|c| c.name == name).cloned()))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceDefinition>> {
        Ok(self
            .schema_at()
            .map(|(namespaces, _)| namespaces.as_ref().clone())
            .unwrap_or_default())
    }

    async fn list_caveats(&self) -> Result<Vec<CaveatDefinition>> {
        Ok(self
            .schema_at()
            .map(|(_, caveats)| caveats.as_ref().clone())
            .unwrap_or_default())
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<NamespaceDefinition>> {
        Ok(self
            .list_namespaces()
            .await?
            .into_iter()
            .filter(|ns| names.contains(&ns.name))
            .collect())
    }

    async fn lookup_caveats_with_names(&self, names: &[String]) -> Result<Vec<CaveatDefinition>> {
        Ok(self
            .list_caveats()
            .await?
            .into_iter()
            .filter(|c| names.contains(&c.name))
            .collect())
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator> {
        Ok(self.collect(|t| filter.matches(t), options))
    }

    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> Result<TupleIterator> {
        Ok(self.collect(|t| filter.matches(t), options))
    }
}
