use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rebac_datastore::{QueryOptions, RelationshipsFilter};
use rebac_models::{ObjectAndRelation, ELLIPSIS};
use rebac_schema::{ChildKind, SetOperation, UsersetRewrite};

use crate::context::RequestContext;
use crate::error::{DispatchError, Result};
use crate::request::{ExpandSubject, ExpandTree};

type BoxedExpand = Pin<Box<dyn Future<Output = Result<ExpandTree>> + Send>>;

/// Materialize the rewrite tree of a relation, with stored edges as
/// concrete subject-set leaves. Userset subjects are left as references;
/// callers that need them flattened follow up with further expands.
pub(crate) fn expand_internal(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    depth: u32,
) -> BoxedExpand {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.record_depth_used(depth);
        ctx.counters.record_dispatch();

        let rewrite = ctx
            .schema
            .relation_or_err(&resource.namespace, &resource.relation)?
            .userset_rewrite
            .clone();
        match rewrite {
            Some(rewrite) => expand_rewrite(ctx, resource, rewrite, depth).await,
            None => expand_direct(ctx, resource).await,
        }
    })
}

async fn expand_direct(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
) -> Result<ExpandTree> {
    let filter = RelationshipsFilter::for_resource(
        &resource.namespace,
        &resource.object_id,
        &resource.relation,
    );
    let subjects = ctx
        .reader
        .query_relationships(&filter, &QueryOptions::default())
        .await?
        .map(|tuple| ExpandSubject {
            subject: tuple.subject,
            caveat: tuple.caveat,
        })
        .collect();
    Ok(ExpandTree::Subjects { resource, subjects })
}

fn expand_rewrite(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    rewrite: UsersetRewrite,
    depth: u32,
) -> BoxedExpand {
    Box::pin(async move {
        let mut children = Vec::with_capacity(rewrite.children.len());
        for child in rewrite.children {
            let tree = match child.child {
                ChildKind::This => expand_direct(ctx.clone(), resource.clone()).await?,
                ChildKind::ComputedUserset { relation } => {
                    expand_internal(ctx.clone(), resource.with_relation(&relation), depth - 1)
                        .await?
                }
                ChildKind::TupleToUserset {
                    tupleset_relation,
                    computed_relation,
                } => {
                    expand_arrow(
                        ctx.clone(),
                        resource.clone(),
                        &tupleset_relation,
                        &computed_relation,
                        depth,
                    )
                    .await?
                }
                ChildKind::Rewrite(nested) => {
                    expand_rewrite(ctx.clone(), resource.clone(), *nested, depth).await?
                }
                ChildKind::Nil => ExpandTree::Subjects {
                    resource: resource.clone(),
                    subjects: Vec::new(),
                },
            };
            children.push(tree);
        }
        Ok(ExpandTree::Operation {
            resource,
            operation: rewrite.operation,
            children,
        })
    })
}

async fn expand_arrow(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    tupleset_relation: &str,
    computed_relation: &str,
    depth: u32,
) -> Result<ExpandTree> {
    let filter = RelationshipsFilter::for_resource(
        &resource.namespace,
        &resource.object_id,
        tupleset_relation,
    );
    let intermediates: Vec<_> = ctx
        .reader
        .query_relationships(&filter, &QueryOptions::default())
        .await?
        .collect();

    let mut children = Vec::new();
    for edge in intermediates {
        let intermediate = edge.subject;
        if intermediate.relation != ELLIPSIS {
            continue;
        }
        if ctx
            .schema
            .relation(&intermediate.namespace, computed_relation)
            .is_none()
        {
            continue;
        }
        children.push(
            expand_internal(
                ctx.clone(),
                intermediate.with_relation(computed_relation),
                depth - 1,
            )
            .await?,
        );
    }
    Ok(ExpandTree::Operation {
        resource,
        operation: SetOperation::Union,
        children,
    })
}
