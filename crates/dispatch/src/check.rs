use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use rebac_caveats::{evaluate_expression, ExpressionResult};
use rebac_datastore::{QueryOptions, RelationshipsFilter};
use rebac_models::{
    CaveatExpression, ContextualizedCaveat, ObjectAndRelation, ELLIPSIS, WILDCARD,
};
use rebac_schema::{ChildKind, SetOperation, UsersetRewrite};

use crate::context::RequestContext;
use crate::error::{DispatchError, Result};
use crate::request::Membership;

type BoxedCheck = Pin<Box<dyn Future<Output = Result<Membership>> + Send>>;

/// One dispatched check sub-problem. Results are memoized and
/// single-flighted through the shared dispatch cache; the cache key folds
/// in the relation's canonical key so semantically identical permissions
/// share entries across schema versions.
pub(crate) fn check_internal(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    depth: u32,
) -> BoxedCheck {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.record_depth_used(depth);

        let canonical = ctx
            .schema
            .canonical_key(&resource.namespace, &resource.relation)?;
        let key = format!(
            "check:{}:{}:{}:{}:{}:{}",
            canonical.to_hex(),
            resource.namespace,
            resource.object_id,
            subject,
            ctx.revision,
            depth,
        );

        let computed = Arc::new(AtomicBool::new(false));
        let result = {
            let ctx = ctx.clone();
            let computed = computed.clone();
            ctx.cache
                .clone()
                .get_or_compute(&key, move || async move {
                    computed.store(true, Ordering::SeqCst);
                    ctx.counters.record_dispatch();
                    evaluate_relation(ctx.clone(), resource, subject, depth).await
                })
                .await
        };
        if !computed.load(Ordering::SeqCst) {
            ctx.counters.record_cached();
        }
        result
    })
}

async fn evaluate_relation(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    depth: u32,
) -> Result<Membership> {
    let rewrite = ctx
        .schema
        .relation_or_err(&resource.namespace, &resource.relation)?
        .userset_rewrite
        .clone();
    match rewrite {
        Some(rewrite) => evaluate_rewrite(ctx, resource, subject, rewrite, depth).await,
        None => check_direct(ctx, resource, subject, depth).await,
    }
}

/// Stored edges on the relation: direct hits, wildcard hits, and userset
/// subjects the check recurses into.
async fn check_direct(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    depth: u32,
) -> Result<Membership> {
    let filter = RelationshipsFilter::for_resource(
        &resource.namespace,
        &resource.object_id,
        &resource.relation,
    );
    let edges: Vec<_> = ctx
        .reader
        .query_relationships(&filter, &QueryOptions::default())
        .await?
        .collect();

    let mut conditionals = Vec::new();
    let mut userset_tasks: Vec<BoxedCheck> = Vec::new();
    for edge in edges {
        let edge_subject = &edge.subject;
        let direct_hit = *edge_subject == subject
            || (edge_subject.is_wildcard()
                && edge_subject.namespace == subject.namespace
                && subject.relation == ELLIPSIS
                && subject.object_id != WILDCARD);
        if direct_hit {
            match edge.caveat {
                None => return Ok(Membership::Member),
                Some(caveat) => conditionals.push(CaveatExpression::caveat(caveat)),
            }
            continue;
        }
        if edge_subject.relation != ELLIPSIS {
            // A userset subject; membership flows through it.
            let sub = check_internal(
                ctx.clone(),
                edge_subject.clone(),
                subject.clone(),
                depth - 1,
            );
            let caveat = edge.caveat;
            userset_tasks.push(Box::pin(async move {
                Ok(apply_edge_caveat(sub.await?, caveat))
            }));
        }
    }

    match eval_union(&ctx, userset_tasks).await? {
        Membership::Member => Ok(Membership::Member),
        Membership::NotMember => Ok(fold_conditionals(conditionals)),
        Membership::Conditional(expr) => {
            conditionals.push(expr);
            Ok(fold_conditionals(conditionals))
        }
    }
}

fn evaluate_rewrite(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    rewrite: UsersetRewrite,
    depth: u32,
) -> BoxedCheck {
    Box::pin(async move {
        let tasks: Vec<BoxedCheck> = rewrite
            .children
            .into_iter()
            .map(|child| child_task(&ctx, &resource, &subject, child.child, depth))
            .collect();
        match rewrite.operation {
            SetOperation::Union => eval_union(&ctx, tasks).await,
            SetOperation::Intersection => eval_intersection(&ctx, tasks).await,
            SetOperation::Exclusion => eval_exclusion(tasks).await,
        }
    })
}

fn child_task(
    ctx: &Arc<RequestContext>,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    child: ChildKind,
    depth: u32,
) -> BoxedCheck {
    match child {
        ChildKind::This => Box::pin(check_direct(
            ctx.clone(),
            resource.clone(),
            subject.clone(),
            depth,
        )),
        ChildKind::ComputedUserset { relation } => check_internal(
            ctx.clone(),
            resource.with_relation(&relation),
            subject.clone(),
            depth.saturating_sub(1),
        ),
        ChildKind::TupleToUserset {
            tupleset_relation,
            computed_relation,
        } => Box::pin(eval_arrow(
            ctx.clone(),
            resource.clone(),
            subject.clone(),
            tupleset_relation,
            computed_relation,
            depth,
        )),
        ChildKind::Rewrite(nested) => evaluate_rewrite(
            ctx.clone(),
            resource.clone(),
            subject.clone(),
            *nested,
            depth,
        ),
        ChildKind::Nil => Box::pin(std::future::ready(Ok(Membership::NotMember))),
    }
}

/// Follow the tupleset relation's edges, then check the computed relation
/// on each intermediate object, combining under union.
async fn eval_arrow(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    tupleset_relation: String,
    computed_relation: String,
    depth: u32,
) -> Result<Membership> {
    if depth == 0 {
        return Err(DispatchError::ExhaustedDepth);
    }
    let filter = RelationshipsFilter::for_resource(
        &resource.namespace,
        &resource.object_id,
        &tupleset_relation,
    );
    let edges: Vec<_> = ctx
        .reader
        .query_relationships(&filter, &QueryOptions::default())
        .await?
        .collect();

    let mut tasks: Vec<BoxedCheck> = Vec::new();
    for edge in edges {
        let intermediate = edge.subject;
        if intermediate.relation != ELLIPSIS {
            continue;
        }
        // The arrow target may only exist on some intermediate types.
        if ctx
            .schema
            .relation(&intermediate.namespace, &computed_relation)
            .is_none()
        {
            continue;
        }
        let sub = check_internal(
            ctx.clone(),
            intermediate.with_relation(&computed_relation),
            subject.clone(),
            depth - 1,
        );
        let caveat = edge.caveat;
        tasks.push(Box::pin(async move {
            Ok(apply_edge_caveat(sub.await?, caveat))
        }));
    }
    eval_union(&ctx, tasks).await
}

/// Union semantics: the first member short-circuits and cancels its
/// siblings; conditional branches accumulate under OR.
async fn eval_union(ctx: &Arc<RequestContext>, tasks: Vec<BoxedCheck>) -> Result<Membership> {
    if tasks.is_empty() {
        return Ok(Membership::NotMember);
    }
    let fanout = ctx.config.max_dispatch_fanout.max(1);
    let mut pending = tasks.into_iter();
    let mut join_set = JoinSet::new();
    for task in pending.by_ref().take(fanout) {
        join_set.spawn(task);
    }

    let mut conditionals = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined.map_err(join_to_dispatch)?? {
            Membership::Member => {
                join_set.abort_all();
                return Ok(Membership::Member);
            }
            Membership::NotMember => {}
            Membership::Conditional(expr) => conditionals.push(expr),
        }
        if let Some(task) = pending.next() {
            join_set.spawn(task);
        }
    }
    Ok(fold_conditionals(conditionals))
}

/// Intersection semantics: the first non-member short-circuits and
/// cancels its siblings; conditional branches accumulate under AND.
async fn eval_intersection(
    ctx: &Arc<RequestContext>,
    tasks: Vec<BoxedCheck>,
) -> Result<Membership> {
    if tasks.is_empty() {
        return Ok(Membership::NotMember);
    }
    let fanout = ctx.config.max_dispatch_fanout.max(1);
    let mut pending = tasks.into_iter();
    let mut join_set = JoinSet::new();
    for task in pending.by_ref().take(fanout) {
        join_set.spawn(task);
    }

    let mut conditionals = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined.map_err(join_to_dispatch)?? {
            Membership::NotMember => {
                join_set.abort_all();
                return Ok(Membership::NotMember);
            }
            Membership::Member => {}
            Membership::Conditional(expr) => conditionals.push(expr),
        }
        if let Some(task) = pending.next() {
            join_set.spawn(task);
        }
    }
    Ok(match CaveatExpression::all(conditionals) {
        Some(expr) => Membership::Conditional(expr),
        None => Membership::Member,
    })
}

/// Exclusion semantics over exactly two operands: `base AND NOT subtract`,
/// folding certainties before building a residual.
async fn eval_exclusion(mut tasks: Vec<BoxedCheck>) -> Result<Membership> {
    if tasks.len() != 2 {
        return Err(DispatchError::Internal(format!(
            "exclusion expects two operands, found {}",
            tasks.len()
        )));
    }
    let subtract_task = tasks.pop().expect("two operands");
    let base_task = tasks.pop().expect("two operands");

    let base_handle = tokio::spawn(base_task);
    let subtract_handle = tokio::spawn(subtract_task);

    let base = match base_handle.await.map_err(join_to_dispatch) {
        Ok(result) => result?,
        Err(err) => {
            subtract_handle.abort();
            return Err(err);
        }
    };
    if base == Membership::NotMember {
        subtract_handle.abort();
        return Ok(Membership::NotMember);
    }
    let subtract = joined_result(subtract_handle.await)?;

    Ok(match (base, subtract) {
        (_, Membership::Member) => Membership::NotMember,
        (base, Membership::NotMember) => base,
        (Membership::Member, Membership::Conditional(sub)) => {
            Membership::Conditional(CaveatExpression::not(sub))
        }
        (Membership::Conditional(base), Membership::Conditional(sub)) => Membership::Conditional(
            CaveatExpression::and(base, CaveatExpression::not(sub)),
        ),
        (Membership::NotMember, _) => Membership::NotMember,
    })
}

fn joined_result(
    joined: std::result::Result<Result<Membership>, JoinError>,
) -> Result<Membership> {
    joined.map_err(join_to_dispatch)?
}

fn join_to_dispatch(err: JoinError) -> DispatchError {
    if err.is_cancelled() {
        DispatchError::Cancelled
    } else {
        DispatchError::Internal(format!("dispatch task failed: {}", err))
    }
}

fn fold_conditionals(conditionals: Vec<CaveatExpression>) -> Membership {
    match CaveatExpression::any(conditionals) {
        Some(expr) => Membership::Conditional(expr),
        None => Membership::NotMember,
    }
}

fn apply_edge_caveat(
    membership: Membership,
    caveat: Option<ContextualizedCaveat>,
) -> Membership {
    let caveat = match caveat {
        Some(caveat) => caveat,
        None => return membership,
    };
    let leaf = CaveatExpression::caveat(caveat);
    match membership {
        Membership::Member => Membership::Conditional(leaf),
        Membership::NotMember => Membership::NotMember,
        Membership::Conditional(expr) => {
            Membership::Conditional(CaveatExpression::and(leaf, expr))
        }
    }
}

/// Fold a conditional result with the request's caveat context. Anything
/// the context fully decides collapses to a certainty; what remains is
/// returned as the simplified residual.
pub(crate) fn resolve_membership(ctx: &RequestContext, membership: Membership) -> Membership {
    let expr = match membership {
        Membership::Conditional(expr) => expr,
        decided => return decided,
    };
    let schema = ctx.schema.clone();
    let lookup = move |name: &str| schema.caveat(name).cloned();
    match evaluate_expression(&expr, &lookup, &ctx.caveat_context) {
        Ok(ExpressionResult::True) => Membership::Member,
        Ok(ExpressionResult::False) => Membership::NotMember,
        Ok(ExpressionResult::Partial(residual)) => Membership::Conditional(residual),
        Err(err) => {
            tracing::warn!("Caveat resolution failed, leaving branch conditional: {}", err);
            Membership::Conditional(expr)
        }
    }
}
