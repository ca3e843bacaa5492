use std::time::Duration;

/// Tunables for the dispatch and cache core.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum recursion depth before a request fails with depth
    /// exhaustion.
    pub max_depth: u32,
    /// Hard cap on concurrently evaluated children per rewrite node.
    pub max_dispatch_fanout: usize,
    /// Entries retained by the shared dispatch result cache.
    pub request_cache_capacity: usize,
    /// Staleness budget added to the datastore's advertised revision
    /// validity.
    pub max_revision_staleness: Duration,
    /// Default cap on results per lookup request.
    pub default_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_dispatch_fanout: 16,
            request_cache_capacity: 10_000,
            max_revision_staleness: Duration::ZERO,
            default_limit: 1_000,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_depth: std::env::var("DISPATCH_MAX_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_depth),
            max_dispatch_fanout: std::env::var("DISPATCH_MAX_FANOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_dispatch_fanout),
            request_cache_capacity: std::env::var("DISPATCH_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_cache_capacity),
            max_revision_staleness: std::env::var("DISPATCH_MAX_REVISION_STALENESS_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_revision_staleness),
            default_limit: std::env::var("DISPATCH_DEFAULT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_limit),
        }
    }
}
