use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Hit/miss counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

type Inflight<V, E> = watch::Receiver<Option<std::result::Result<V, E>>>;

/// Memoizes dispatch sub-results for the lifetime of an outer request and
/// de-duplicates identical computations that are in flight at the same
/// time. Completed entries are read lock-free; only the in-flight table
/// sees writer contention.
///
/// The first caller for a key runs the computation inline; concurrent
/// callers for the same key wait on its published outcome. If the
/// computing caller is cancelled mid-flight, one of the waiters takes
/// over and recomputes.
pub struct RequestCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    entries: DashMap<String, V>,
    inflight: DashMap<String, Inflight<V, E>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V, E> RequestCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Look up `key`, or run `compute` exactly once among concurrent
    /// callers and share its outcome. Successful results are retained up
    /// to the configured capacity; errors are returned to every waiter
    /// but never cached.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        loop {
            if let Some(entry) = self.entries.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.clone());
            }

            // Decide a role under the shard lock, then release it before
            // any await.
            let wait_on = {
                let mut publisher = None;
                let waiter = match self.inflight.entry(key.to_string()) {
                    dashmap::mapref::entry::Entry::Occupied(occupied) => {
                        Some(occupied.get().clone())
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        let (tx, rx) = watch::channel(None);
                        vacant.insert(rx);
                        publisher = Some(tx);
                        None
                    }
                };
                match publisher {
                    Some(tx) => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        let result = compute().await;
                        self.inflight.remove(key);
                        if let Ok(value) = &result {
                            if self.entries.len() < self.capacity {
                                self.entries.insert(key.to_string(), value.clone());
                            }
                        }
                        let _ = tx.send(Some(result.clone()));
                        return result;
                    }
                    None => waiter,
                }
            };

            if let Some(mut rx) = wait_on {
                loop {
                    let published = rx.borrow().clone();
                    if let Some(result) = published {
                        if result.is_ok() {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                        }
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // The computing caller was dropped before
                        // publishing. Clear its slot and race to take
                        // over.
                        self.inflight.remove(key);
                        break;
                    }
                }
            }
        }
    }

    /// Directly insert a completed result.
    pub fn insert(&self, key: &str, value: V) {
        if self.entries.len() < self.capacity {
            self.entries.insert(key.to_string(), value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
