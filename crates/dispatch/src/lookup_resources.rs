use dashmap::DashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use rebac_datastore::{QueryOptions, SubjectsFilter};
use rebac_models::{ObjectAndRelation, ELLIPSIS, WILDCARD};
use rebac_schema::{Entrypoint, EntrypointKind, ReachabilityGraph, ResultStatus};

use crate::check::{check_internal, resolve_membership};
use crate::context::RequestContext;
use crate::error::{DispatchError, Result};
use crate::request::{LookedUpResource, Membership, ReachableResource};

const STREAM_BUFFER: usize = 16;

/// Shared state of one reachable-resources walk: the target's graph, the
/// dedup sets, the emission budget and the subtree cancellation scope.
struct WalkShared {
    graph: Arc<ReachabilityGraph>,
    visited: DashSet<String>,
    emitted: DashSet<String>,
    /// Negative once the budget is spent; `i64::MAX` when unlimited.
    remaining: AtomicI64,
    tx: mpsc::Sender<Result<ReachableResource>>,
    cancel: CancellationToken,
}

/// Start the reachability walk for `(resource_type, permission)` from the
/// given subject. Candidates stream through the returned receiver as they
/// are found; the token cancels every outstanding branch.
pub(crate) fn spawn_reachable(
    ctx: Arc<RequestContext>,
    graph: Arc<ReachabilityGraph>,
    subject: ObjectAndRelation,
    limit: Option<usize>,
) -> (mpsc::Receiver<Result<ReachableResource>>, CancellationToken) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let cancel = ctx.cancel.child_token();
    let shared = Arc::new(WalkShared {
        graph,
        visited: DashSet::new(),
        emitted: DashSet::new(),
        remaining: AtomicI64::new(limit.map(|l| l as i64).unwrap_or(i64::MAX)),
        tx,
        cancel: cancel.clone(),
    });

    let depth = ctx.initial_depth;
    tokio::spawn(async move {
        if let Err(err) = walk(ctx, shared.clone(), subject, ResultStatus::Direct, depth).await {
            // Depth exhaustion and datastore failures surface in-stream.
            let _ = shared.tx.send(Err(err)).await;
        }
    });
    (rx, cancel)
}

fn walk(
    ctx: Arc<RequestContext>,
    shared: Arc<WalkShared>,
    subject: ObjectAndRelation,
    status: ResultStatus,
    depth: u32,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }
        if depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.record_depth_used(depth);
        if !shared
            .visited
            .insert(format!("{}|{:?}", subject, status))
        {
            return Ok(());
        }

        let entrypoints: Vec<Entrypoint> = shared
            .graph
            .entrypoints_for(&subject)
            .into_iter()
            .cloned()
            .collect();
        if entrypoints.is_empty() {
            return Ok(());
        }
        ctx.counters.record_dispatch();

        // Every entrypoint is its own concurrent subtree.
        let fanout = ctx.config.max_dispatch_fanout.max(1);
        let mut pending = entrypoints.into_iter();
        let mut join_set = JoinSet::new();
        for entrypoint in pending.by_ref().take(fanout) {
            join_set.spawn(follow_entrypoint(
                ctx.clone(),
                shared.clone(),
                subject.clone(),
                entrypoint,
                status,
                depth,
            ));
        }
        while let Some(joined) = join_set.join_next().await {
            joined.map_err(|e| DispatchError::Internal(format!("lookup task failed: {}", e)))??;
            if let Some(entrypoint) = pending.next() {
                join_set.spawn(follow_entrypoint(
                    ctx.clone(),
                    shared.clone(),
                    subject.clone(),
                    entrypoint,
                    status,
                    depth,
                ));
            }
        }
        Ok(())
    })
}

async fn follow_entrypoint(
    ctx: Arc<RequestContext>,
    shared: Arc<WalkShared>,
    subject: ObjectAndRelation,
    entrypoint: Entrypoint,
    status: ResultStatus,
    depth: u32,
) -> Result<()> {
    let combined = status.combine(entrypoint.result_status);
    match entrypoint.kind {
        // The subject's relation implies the target relation on the same
        // object; a pure rewrite hop.
        EntrypointKind::ComputedUserset => {
            let reached = subject.with_relation(&entrypoint.target_relation);
            handle_reached(ctx, shared, reached, combined, depth).await
        }
        // Stored edges carry the subject into the target relation.
        EntrypointKind::Relation => {
            let mut subject_ids = vec![subject.object_id.clone()];
            if subject.relation == ELLIPSIS && subject.object_id != WILDCARD {
                subject_ids.push(WILDCARD.to_string());
            }
            let filter = SubjectsFilter {
                subject_type: subject.namespace.clone(),
                subject_ids,
                subject_relation: Some(subject.relation.clone()),
                resource_type: Some(entrypoint.target_namespace.clone()),
                relation: Some(entrypoint.target_relation.clone()),
            };
            let tuples: Vec<_> = ctx
                .reader
                .reverse_query_relationships(&filter, &QueryOptions::default())
                .await?
                .collect();
            for tuple in tuples {
                // A caveated edge leaves the candidate conditional even on
                // an all-union path.
                let reached_status = if tuple.caveat.is_some() {
                    ResultStatus::Conditional
                } else {
                    combined
                };
                handle_reached(
                    ctx.clone(),
                    shared.clone(),
                    tuple.resource,
                    reached_status,
                    depth,
                )
                .await?;
            }
            Ok(())
        }
        // The subject holds the computed relation on an intermediate
        // object; resources arrive via the tupleset edges pointing at it.
        EntrypointKind::TuplesetToUserset => {
            let filter = SubjectsFilter {
                subject_type: subject.namespace.clone(),
                subject_ids: vec![subject.object_id.clone()],
                subject_relation: Some(ELLIPSIS.to_string()),
                resource_type: Some(entrypoint.target_namespace.clone()),
                relation: entrypoint.tupleset_relation.clone(),
            };
            let tuples: Vec<_> = ctx
                .reader
                .reverse_query_relationships(&filter, &QueryOptions::default())
                .await?
                .collect();
            for tuple in tuples {
                let reached = tuple.resource.with_relation(&entrypoint.target_relation);
                let reached_status = if tuple.caveat.is_some() {
                    ResultStatus::Conditional
                } else {
                    combined
                };
                handle_reached(ctx.clone(), shared.clone(), reached, reached_status, depth)
                    .await?;
            }
            Ok(())
        }
    }
}

async fn handle_reached(
    ctx: Arc<RequestContext>,
    shared: Arc<WalkShared>,
    reached: ObjectAndRelation,
    status: ResultStatus,
    depth: u32,
) -> Result<()> {
    if shared.graph.is_target(&reached) && shared.emitted.insert(reached.object_id.clone()) {
        let budget = shared.remaining.fetch_sub(1, Ordering::SeqCst);
        if budget <= 0 {
            shared.cancel.cancel();
            return Ok(());
        }
        let item = ReachableResource {
            resource_id: reached.object_id.clone(),
            status,
        };
        if shared.tx.send(Ok(item)).await.is_err() {
            // Receiver went away; stop producing.
            shared.cancel.cancel();
            return Ok(());
        }
        if budget == 1 {
            tracing::debug!(
                "Reachable-resources limit reached for {}, cancelling outstanding branches",
                shared.graph.resource_relation()
            );
            shared.cancel.cancel();
            return Ok(());
        }
    }
    // Recursive schemas can reach further resources through the target
    // itself, so the walk continues either way.
    walk(ctx, shared, reached, status, depth - 1).await
}

/// Two-phase lookup: stream reachable candidates, confirm the conditional
/// ones with a positive check, and emit at most `limit` unique resources.
pub(crate) async fn run_lookup_resources(
    ctx: Arc<RequestContext>,
    graph: Arc<ReachabilityGraph>,
    resource_type: String,
    permission: String,
    subject: ObjectAndRelation,
    limit: usize,
    tx: mpsc::Sender<Result<LookedUpResource>>,
) {
    let (mut candidates, walk_cancel) = spawn_reachable(ctx.clone(), graph, subject.clone(), None);
    let mut emitted = 0usize;

    while let Some(candidate) = candidates.recv().await {
        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                break;
            }
        };

        let conditional = match candidate.status {
            ResultStatus::Direct => Some(false),
            ResultStatus::Conditional => {
                // Membership is not implied by reachability here; confirm.
                let resource = ObjectAndRelation {
                    namespace: resource_type.clone(),
                    object_id: candidate.resource_id.clone(),
                    relation: permission.clone(),
                };
                let checked = check_internal(
                    ctx.clone(),
                    resource,
                    subject.clone(),
                    ctx.initial_depth,
                )
                .await;
                match checked {
                    Ok(membership) => match resolve_membership(&ctx, membership) {
                        Membership::Member => Some(false),
                        Membership::Conditional(_) => Some(true),
                        Membership::NotMember => None,
                    },
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        };

        if let Some(conditional) = conditional {
            let item = LookedUpResource {
                resource_id: candidate.resource_id,
                conditional,
            };
            if tx.send(Ok(item)).await.is_err() {
                break;
            }
            emitted += 1;
            if emitted >= limit {
                break;
            }
        }
    }
    walk_cancel.cancel();
}
