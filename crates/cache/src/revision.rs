use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use rebac_datastore::Datastore;
use rebac_models::Revision;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone)]
pub struct RevisionCacheConfig {
    /// Extra lifetime granted to a revision beyond what the datastore
    /// advertises. Zero means callers always read at the freshest
    /// optimized revision.
    pub max_staleness: Duration,
    /// Budget for one refresh round-trip, independent of any caller's
    /// deadline.
    pub refresh_timeout: Duration,
}

impl Default for RevisionCacheConfig {
    fn default() -> Self {
        Self {
            max_staleness: Duration::ZERO,
            refresh_timeout: Duration::from_secs(5),
        }
    }
}

impl RevisionCacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_staleness: std::env::var("REVISION_MAX_STALENESS_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_staleness),
            refresh_timeout: std::env::var("REVISION_REFRESH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.refresh_timeout),
        }
    }
}

type RefreshOutcome = Option<Result<(Revision, Instant)>>;

struct Inner {
    cached: Option<(Revision, Instant)>,
    inflight: Option<watch::Receiver<RefreshOutcome>>,
}

/// Produces consistency tokens for reads without a binding staleness
/// constraint. A cached `(revision, valid_until)` pair serves most calls;
/// when it expires, exactly one refresh runs regardless of how many
/// callers arrive, and every waiter observes the same outcome. The
/// refresh runs on a detached task, so a waiter abandoning its wait never
/// cancels the refresh the others depend on.
pub struct CachedOptimizedRevision {
    datastore: Arc<dyn Datastore>,
    config: RevisionCacheConfig,
    state: Arc<Mutex<Inner>>,
}

impl CachedOptimizedRevision {
    pub fn new(datastore: Arc<dyn Datastore>, config: RevisionCacheConfig) -> Self {
        Self {
            datastore,
            config,
            state: Arc::new(Mutex::new(Inner {
                cached: None,
                inflight: None,
            })),
        }
    }

    /// The revision callers should read at.
    pub async fn optimized_revision(&self) -> Result<Revision> {
        loop {
            let mut rx = {
                let mut inner = self.state.lock().await;
                if let Some((revision, valid_until)) = inner.cached {
                    if Instant::now() < valid_until {
                        return Ok(revision);
                    }
                }
                match &inner.inflight {
                    Some(rx) => rx.clone(),
                    None => {
                        let rx = self.start_refresh();
                        inner.inflight = Some(rx.clone());
                        rx
                    }
                }
            };

            // Wait outside the lock so late joiners can subscribe.
            loop {
                let outcome = rx.borrow().clone();
                if let Some(result) = outcome {
                    match result {
                        Ok((revision, _)) => return Ok(revision),
                        Err(err) => return Err(err),
                    }
                }
                if rx.changed().await.is_err() {
                    // Producer vanished without publishing; start over.
                    break;
                }
            }
        }
    }

    fn start_refresh(&self) -> watch::Receiver<RefreshOutcome> {
        let (tx, rx) = watch::channel(None);
        let datastore = self.datastore.clone();
        let state = self.state.clone();
        let max_staleness = self.config.max_staleness;
        let refresh_timeout = self.config.refresh_timeout;

        tokio::spawn(async move {
            let outcome =
                match tokio::time::timeout(refresh_timeout, datastore.optimized_revision()).await {
                    Ok(Ok((revision, validity))) => {
                        let valid_until = Instant::now() + validity + max_staleness;
                        Ok((revision, valid_until))
                    }
                    Ok(Err(err)) => Err(CacheError::RefreshFailed(err.to_string())),
                    Err(_) => Err(CacheError::RefreshTimeout),
                };

            let mut inner = state.lock().await;
            inner.inflight = None;
            match &outcome {
                Ok((revision, valid_until)) => {
                    inner.cached = Some((*revision, *valid_until));
                    tracing::debug!("Refreshed optimized revision to {}", revision);
                }
                Err(err) => {
                    // Errors are delivered to the joined waiters but never
                    // cached.
                    tracing::warn!("Optimized revision refresh failed: {}", err);
                }
            }
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rebac_datastore::{
        DatastoreError, FeatureSet, MemoryDatastore, RevisionCheckResult, SnapshotReader,
        WatchStream,
    };
    use rebac_models::RelationshipUpdate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let store = MemoryDatastore::new();
        let cache = Arc::new(CachedOptimizedRevision::new(
            Arc::new(store.clone()),
            RevisionCacheConfig {
                max_staleness: Duration::from_millis(10),
                refresh_timeout: Duration::from_secs(1),
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.optimized_revision().await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.optimized_revision_calls(), 1);

        // After the staleness budget elapses, the next caller refreshes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.optimized_revision().await.unwrap();
        assert_eq!(store.optimized_revision_calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_within_validity() -> anyhow::Result<()> {
        let store = MemoryDatastore::with_revision_validity(Duration::from_secs(60));
        let cache = CachedOptimizedRevision::new(
            Arc::new(store.clone()),
            RevisionCacheConfig::default(),
        );
        for _ in 0..5 {
            cache.optimized_revision().await?;
        }
        assert_eq!(store.optimized_revision_calls(), 1);
        Ok(())
    }

    struct FailingDatastore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl rebac_datastore::Datastore for FailingDatastore {
        async fn optimized_revision(&self) -> rebac_datastore::Result<(Revision, Duration)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(DatastoreError::Unavailable("backend offline".to_string()))
        }

        async fn head_revision(&self) -> rebac_datastore::Result<Revision> {
            Ok(Revision::ZERO)
        }

        async fn check_revision(
            &self,
            _revision: Revision,
        ) -> rebac_datastore::Result<RevisionCheckResult> {
            Ok(RevisionCheckResult::Ok)
        }

        fn snapshot(&self, _revision: Revision) -> Arc<dyn SnapshotReader> {
            unreachable!("not used in this test")
        }

        async fn read_write_tx(
            &self,
            _updates: Vec<RelationshipUpdate>,
        ) -> rebac_datastore::Result<Revision> {
            Ok(Revision::ZERO)
        }

        fn watch(&self, _after: Revision) -> WatchStream {
            let (_, changes) = tokio::sync::mpsc::unbounded_channel();
            let (_, errors) = tokio::sync::mpsc::unbounded_channel();
            WatchStream { changes, errors }
        }

        fn features(&self) -> FeatureSet {
            FeatureSet::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_error_fails_all_waiters_and_is_not_cached() {
        let store = Arc::new(FailingDatastore {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(CachedOptimizedRevision::new(
            store.clone(),
            RevisionCacheConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.optimized_revision().await },
            ));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::RefreshFailed(_)));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        // Nothing was cached: the next call refreshes again.
        let _ = cache.optimized_revision().await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_refresh() {
        let store = MemoryDatastore::new();
        let cache = Arc::new(CachedOptimizedRevision::new(
            Arc::new(store.clone()),
            RevisionCacheConfig {
                max_staleness: Duration::from_secs(60),
                refresh_timeout: Duration::from_secs(1),
            },
        ));

        // A waiter that gives up almost immediately.
        let impatient = cache.clone();
        let _ = tokio::time::timeout(Duration::from_micros(1), async move {
            impatient.optimized_revision().await
        })
        .await;

        // The refresh it started still completes and serves others.
        let revision = cache.optimized_revision().await.unwrap();
        assert_eq!(revision, Revision::ZERO);
        assert_eq!(store.optimized_revision_calls(), 1);
    }
}
