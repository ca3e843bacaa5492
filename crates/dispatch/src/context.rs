use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rebac_cache::RequestCache;
use rebac_datastore::SnapshotReader;
use rebac_models::Revision;
use rebac_schema::Schema;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::request::{DispatchMetadata, Membership};

/// Per-request evaluation counters, shared by every task the request
/// fans out.
#[derive(Default)]
pub(crate) struct Counters {
    dispatches: AtomicU64,
    cached: AtomicU64,
    depth_required: AtomicU32,
}

impl Counters {
    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_depth(&self, used: u32) {
        self.depth_required.fetch_max(used, Ordering::Relaxed);
    }

    pub fn metadata(&self, trace_id: Uuid) -> DispatchMetadata {
        DispatchMetadata {
            trace_id,
            dispatch_count: self.dispatches.load(Ordering::Relaxed),
            cached_dispatch_count: self.cached.load(Ordering::Relaxed),
            depth_required: self.depth_required.load(Ordering::Relaxed),
        }
    }
}

/// Everything one API call's dispatch tasks share: the immutable schema
/// handle, a snapshot reader pinned at the chosen revision, the dispatch
/// cache, cancellation scope and counters.
pub(crate) struct RequestContext {
    pub trace_id: Uuid,
    pub schema: Arc<Schema>,
    pub reader: Arc<dyn SnapshotReader>,
    pub revision: Revision,
    pub config: DispatchConfig,
    pub cancel: CancellationToken,
    pub counters: Arc<Counters>,
    pub cache: Arc<RequestCache<Membership, DispatchError>>,
    /// Caveat parameter bindings supplied with the request.
    pub caveat_context: BTreeMap<String, serde_json::Value>,
    /// The depth budget the request started with.
    pub initial_depth: u32,
}

impl RequestContext {
    pub fn metadata(&self) -> DispatchMetadata {
        self.counters.metadata(self.trace_id)
    }

    /// How deep the recursion currently is, for the depth-required
    /// counter.
    pub fn record_depth_used(&self, remaining: u32) {
        self.counters
            .record_depth(self.initial_depth.saturating_sub(remaining) + 1);
    }
}
