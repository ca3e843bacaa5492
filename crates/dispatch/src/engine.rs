use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rebac_cache::{CachedOptimizedRevision, RequestCache, RevisionCacheConfig};
use rebac_datastore::{Datastore, RevisionCheckResult, SeveredDatastore};
use rebac_models::{RelationshipUpdate, Revision, UpdateOperation};
use rebac_schema::Schema;

use crate::check::{check_internal, resolve_membership};
use crate::config::DispatchConfig;
use crate::context::{Counters, RequestContext};
use crate::error::{DispatchError, Result};
use crate::expand::expand_internal;
use crate::lookup_resources::{run_lookup_resources, spawn_reachable};
use crate::lookup_subjects::lookup_subjects_internal;
use crate::request::{
    CheckRequest, CheckResponse, DispatchMetadata, ExpandRequest, ExpandResponse,
    LookedUpResource, LookedUpSubject, LookupResourcesRequest, LookupSubjectsRequest, Membership,
    ReachableResource,
};

const SCHEMA_MEMO_LIMIT: usize = 128;
const STREAM_BUFFER: usize = 16;

/// The permission evaluation engine: Check, Expand, LookupResources,
/// LookupSubjects and ReachableResources over the relationship graph, at
/// caller-chosen revisions, with shared result caching.
///
/// The engine holds no per-request state beyond its caches; it is cheap
/// to share behind an `Arc` and safe to call concurrently.
pub struct DispatchEngine {
    datastore: Arc<dyn Datastore>,
    config: DispatchConfig,
    revisions: CachedOptimizedRevision,
    cache: Arc<RequestCache<Membership, DispatchError>>,
    schemas: DashMap<Revision, Arc<Schema>>,
}

impl DispatchEngine {
    pub fn new(datastore: Arc<dyn Datastore>, config: DispatchConfig) -> Self {
        // All reads go through the severing proxy: cancelling a dispatch
        // never aborts a datastore operation midway.
        let datastore: Arc<dyn Datastore> = Arc::new(SeveredDatastore::new(datastore));
        let revisions = CachedOptimizedRevision::new(
            datastore.clone(),
            RevisionCacheConfig {
                max_staleness: config.max_revision_staleness,
                ..RevisionCacheConfig::default()
            },
        );
        let cache = Arc::new(RequestCache::new(config.request_cache_capacity));
        Self {
            datastore,
            config,
            revisions,
            cache,
            schemas: DashMap::new(),
        }
    }

    /// The consistency token callers should read at when they carry no
    /// stricter requirement.
    pub async fn optimized_revision(&self) -> Result<Revision> {
        Ok(self.revisions.optimized_revision().await?)
    }

    pub async fn head_revision(&self) -> Result<Revision> {
        Ok(self.datastore.head_revision().await?)
    }

    /// Validate admissibility against the current schema and apply the
    /// updates atomically.
    pub async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<Revision> {
        let head = self.datastore.head_revision().await?;
        let schema = self.load_schema(head).await?;
        for update in &updates {
            if update.operation != UpdateOperation::Delete {
                schema.check_admissible(&update.tuple)?;
            }
        }
        Ok(self.datastore.read_write_tx(updates).await?)
    }

    /// Does the subject hold the permission on the resource?
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        let ctx = self
            .request_context(request.revision, request.context, request.depth)
            .await?;
        let work = {
            let ctx = ctx.clone();
            let resource = request.resource;
            let subject = request.subject;
            async move {
                let membership =
                    check_internal(ctx.clone(), resource, subject, ctx.initial_depth).await?;
                Ok::<_, DispatchError>(resolve_membership(&ctx, membership))
            }
        };

        let membership = match request.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result?,
                Err(_) => {
                    ctx.cancel.cancel();
                    return Err(DispatchError::DeadlineExceeded);
                }
            },
            None => work.await?,
        };
        Ok(CheckResponse {
            membership,
            metadata: ctx.metadata(),
        })
    }

    /// Materialize the full rewrite tree of a relation with concrete
    /// subject sets at the leaves.
    pub async fn expand(&self, request: ExpandRequest) -> Result<ExpandResponse> {
        let ctx = self
            .request_context(request.revision, BTreeMap::new(), request.depth)
            .await?;
        let work = expand_internal(ctx.clone(), request.resource, ctx.initial_depth);
        let tree = match request.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result?,
                Err(_) => {
                    ctx.cancel.cancel();
                    return Err(DispatchError::DeadlineExceeded);
                }
            },
            None => work.await?,
        };
        Ok(ExpandResponse {
            tree,
            metadata: ctx.metadata(),
        })
    }

    /// Stream every resource id of the requested type on which the
    /// subject holds the permission. Conditional candidates are confirmed
    /// by a positive check before emission.
    pub async fn lookup_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> Result<LookupStream<LookedUpResource>> {
        let ctx = self
            .request_context(request.revision, request.context, request.depth)
            .await?;
        let graph = ctx
            .schema
            .reachability_graph(&request.resource_type, &request.permission)?;
        let limit = request.limit.unwrap_or(self.config.default_limit);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(run_lookup_resources(
            ctx.clone(),
            graph,
            request.resource_type,
            request.permission,
            request.subject,
            limit,
            tx,
        ));
        Ok(LookupStream::new(rx, ctx))
    }

    /// First phase of resource enumeration: stream candidates reachable
    /// from the subject, overreporting conditional entries for a caller
    /// that follows up with checks.
    pub async fn reachable_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> Result<LookupStream<ReachableResource>> {
        let ctx = self
            .request_context(request.revision, request.context, request.depth)
            .await?;
        let graph = ctx
            .schema
            .reachability_graph(&request.resource_type, &request.permission)?;
        let limit = request.limit.unwrap_or(self.config.default_limit);
        let (rx, _cancel) = spawn_reachable(ctx.clone(), graph, request.subject, Some(limit));
        Ok(LookupStream::new(rx, ctx))
    }

    /// Stream the subject ids of one type holding a permission on a
    /// resource. A wildcard grant surfaces as a literal `*` entry.
    pub async fn lookup_subjects(
        &self,
        request: LookupSubjectsRequest,
    ) -> Result<LookupStream<LookedUpSubject>> {
        let ctx = self
            .request_context(request.revision, request.context, request.depth)
            .await?;
        let limit = request.limit.unwrap_or(self.config.default_limit);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            let subjects = lookup_subjects_internal(
                task_ctx.clone(),
                request.resource,
                request.subject_type,
                task_ctx.initial_depth,
            )
            .await;
            match subjects {
                Ok(set) => {
                    for subject in set.resolve(&task_ctx).into_iter().take(limit) {
                        if tx.send(Ok(subject)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });
        Ok(LookupStream::new(rx, ctx))
    }

    async fn request_context(
        &self,
        revision: Revision,
        caveat_context: BTreeMap<String, serde_json::Value>,
        depth: Option<u32>,
    ) -> Result<Arc<RequestContext>> {
        match self.datastore.check_revision(revision).await? {
            RevisionCheckResult::Ok => {}
            RevisionCheckResult::Stale => {
                return Err(DispatchError::InvalidArgument(format!(
                    "revision {} is no longer available",
                    revision
                )))
            }
            RevisionCheckResult::Invalid => {
                return Err(DispatchError::InvalidArgument(format!(
                    "revision {} is not known",
                    revision
                )))
            }
        }

        let schema = self.load_schema(revision).await?;
        let initial_depth = depth
            .unwrap_or(self.config.max_depth)
            .min(self.config.max_depth);
        Ok(Arc::new(RequestContext {
            trace_id: Uuid::new_v4(),
            schema,
            reader: self.datastore.snapshot(revision),
            revision,
            config: self.config.clone(),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            cache: self.cache.clone(),
            caveat_context,
            initial_depth,
        }))
    }

    async fn load_schema(&self, revision: Revision) -> Result<Arc<Schema>> {
        if let Some(schema) = self.schemas.get(&revision) {
            return Ok(schema.clone());
        }
        let reader = self.datastore.snapshot(revision);
        let namespaces = reader.list_namespaces().await?;
        let caveats = reader.list_caveats().await?;
        let schema = Schema::compile(namespaces, caveats)?;
        if self.schemas.len() >= SCHEMA_MEMO_LIMIT {
            self.schemas.clear();
        }
        self.schemas.insert(revision, schema.clone());
        Ok(schema)
    }
}

/// A streaming lookup response. Items arrive unordered as branches of the
/// evaluation complete; metadata reflects the work done so far.
pub struct LookupStream<T> {
    receiver: mpsc::Receiver<Result<T>>,
    ctx: Arc<RequestContext>,
}

impl<T> LookupStream<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<T>>, ctx: Arc<RequestContext>) -> Self {
        Self { receiver, ctx }
    }

    pub async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }

    /// Cancel all outstanding work feeding this stream.
    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn metadata(&self) -> DispatchMetadata {
        self.ctx.metadata()
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.receiver.recv().await {
            items.push(item?);
        }
        Ok(items)
    }
}
