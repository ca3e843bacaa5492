use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;

use rebac_caveats::{evaluate_expression, ExpressionResult};
use rebac_datastore::{QueryOptions, RelationshipsFilter};
use rebac_models::{CaveatExpression, ObjectAndRelation, ELLIPSIS};
use rebac_schema::{ChildKind, SetOperation, UsersetRewrite};

use crate::context::RequestContext;
use crate::error::{DispatchError, Result};
use crate::request::LookedUpSubject;

/// The set of subject ids of one type holding a relation, with per-entry
/// caveat conditions. A wildcard grant is tracked separately from the
/// concrete ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SubjectSet {
    /// `None` condition means the subject holds the relation outright.
    concrete: BTreeMap<String, Option<CaveatExpression>>,
    wildcard: Option<Option<CaveatExpression>>,
}

impl SubjectSet {
    fn insert(&mut self, id: String, condition: Option<CaveatExpression>) {
        match self.concrete.get_mut(&id) {
            // An unconditional grant absorbs a conditional one; two
            // conditional grants combine under OR.
            Some(existing) => {
                *existing = match (existing.take(), condition) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(CaveatExpression::or(a, b)),
                }
            }
            None => {
                self.concrete.insert(id, condition);
            }
        }
    }

    fn insert_wildcard(&mut self, condition: Option<CaveatExpression>) {
        self.wildcard = match self.wildcard.take() {
            Some(existing) => Some(match (existing, condition) {
                (None, _) | (_, None) => None,
                (Some(a), Some(b)) => Some(CaveatExpression::or(a, b)),
            }),
            None => Some(condition),
        };
    }

    /// AND a caveat onto every entry, for edges traversed under a caveat.
    fn constrained_by(mut self, condition: Option<CaveatExpression>) -> Self {
        let condition = match condition {
            Some(condition) => condition,
            None => return self,
        };
        for entry in self.concrete.values_mut() {
            *entry = Some(match entry.take() {
                None => condition.clone(),
                Some(existing) => CaveatExpression::and(condition.clone(), existing),
            });
        }
        if let Some(entry) = &mut self.wildcard {
            *entry = Some(match entry.take() {
                None => condition.clone(),
                Some(existing) => CaveatExpression::and(condition.clone(), existing),
            });
        }
        self
    }

    fn union(mut self, other: SubjectSet) -> SubjectSet {
        for (id, condition) in other.concrete {
            self.insert(id, condition);
        }
        if let Some(condition) = other.wildcard {
            self.insert_wildcard(condition);
        }
        self
    }

    fn intersect(self, other: SubjectSet) -> SubjectSet {
        let mut result = SubjectSet::default();
        for (id, condition) in &self.concrete {
            let matched = other.concrete.get(id).cloned().or_else(|| {
                other.wildcard.clone()
            });
            if let Some(other_condition) = matched {
                result.concrete.insert(
                    id.clone(),
                    and_conditions(condition.clone(), other_condition),
                );
            }
        }
        // Ids only known on the other side still match this side's
        // wildcard.
        if let Some(wildcard_condition) = &self.wildcard {
            for (id, condition) in &other.concrete {
                if !result.concrete.contains_key(id) {
                    result.concrete.insert(
                        id.clone(),
                        and_conditions(wildcard_condition.clone(), condition.clone()),
                    );
                }
            }
        }
        if let (Some(a), Some(b)) = (self.wildcard, other.wildcard) {
            result.wildcard = Some(and_conditions(a, b));
        }
        result
    }

    fn exclude(mut self, other: SubjectSet) -> SubjectSet {
        if let Some(excluded_wildcard) = other.wildcard {
            match excluded_wildcard {
                // Everything is excluded outright.
                None => return SubjectSet::default(),
                Some(condition) => {
                    let negated = CaveatExpression::not(condition);
                    self = self.constrained_by(Some(negated));
                }
            }
        }
        for (id, condition) in other.concrete {
            match condition {
                None => {
                    self.concrete.remove(&id);
                    // A wildcard cannot carry per-id exceptions in the
                    // emitted form; drop it rather than overclaim.
                    if self.wildcard.take().is_some() {
                        tracing::debug!(
                            "Dropping wildcard subject excluded by concrete id {}",
                            id
                        );
                    }
                }
                Some(excluded_condition) => {
                    let negated = CaveatExpression::not(excluded_condition);
                    if let Some(entry) = self.concrete.get_mut(&id) {
                        *entry = Some(match entry.take() {
                            None => negated,
                            Some(existing) => CaveatExpression::and(existing, negated),
                        });
                    }
                }
            }
        }
        self
    }

    /// Resolve conditions with the request context and flatten into
    /// emission order: concrete ids first, wildcard last.
    pub(crate) fn resolve(self, ctx: &RequestContext) -> Vec<LookedUpSubject> {
        let schema = ctx.schema.clone();
        let lookup = move |name: &str| schema.caveat(name).cloned();
        let mut subjects = Vec::new();
        let entries = self
            .concrete
            .into_iter()
            .map(|(id, condition)| (id, condition))
            .chain(self.wildcard.map(|condition| ("*".to_string(), condition)));
        for (id, condition) in entries {
            match condition {
                None => subjects.push(LookedUpSubject {
                    subject_id: id,
                    conditional: false,
                }),
                Some(expr) => match evaluate_expression(&expr, &lookup, &ctx.caveat_context) {
                    Ok(ExpressionResult::True) => subjects.push(LookedUpSubject {
                        subject_id: id,
                        conditional: false,
                    }),
                    Ok(ExpressionResult::False) => {}
                    Ok(ExpressionResult::Partial(_)) | Err(_) => {
                        subjects.push(LookedUpSubject {
                            subject_id: id,
                            conditional: true,
                        })
                    }
                },
            }
        }
        subjects
    }
}

fn and_conditions(
    a: Option<CaveatExpression>,
    b: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(CaveatExpression::and(a, b)),
    }
}

type BoxedSubjects = Pin<Box<dyn Future<Output = Result<SubjectSet>> + Send>>;

/// Walk a relation forward, collecting every subject id of the requested
/// type that can reach it, honoring set operations and caveats.
pub(crate) fn lookup_subjects_internal(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject_type: String,
    depth: u32,
) -> BoxedSubjects {
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
            Some(rewrite) => {
                subjects_of_rewrite(ctx, resource, subject_type, rewrite, depth).await
            }
            None => subjects_of_direct(ctx, resource, subject_type, depth).await,
        }
    })
}

async fn subjects_of_direct(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject_type: String,
    depth: u32,
) -> Result<SubjectSet> {
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

    let mut set = SubjectSet::default();
    let mut userset_tasks: Vec<BoxedSubjects> = Vec::new();
    for edge in edges {
        let subject = edge.subject;
        let condition = edge
            .caveat
            .map(CaveatExpression::caveat);
        if subject.relation == ELLIPSIS {
            if subject.namespace != subject_type {
                continue;
            }
            if subject.is_wildcard() {
                set.insert_wildcard(condition);
            } else {
                set.insert(subject.object_id, condition);
            }
        } else {
            // Userset subject: its members of the requested type count.
            let sub = lookup_subjects_internal(
                ctx.clone(),
                subject,
                subject_type.clone(),
                depth - 1,
            );
            userset_tasks.push(Box::pin(async move {
                Ok(sub.await?.constrained_by(condition))
            }));
        }
    }

    for resolved in join_all_ordered(&ctx, userset_tasks).await? {
        set = set.union(resolved);
    }
    Ok(set)
}

fn subjects_of_rewrite(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject_type: String,
    rewrite: UsersetRewrite,
    depth: u32,
) -> BoxedSubjects {
    Box::pin(async move {
        let mut tasks: Vec<BoxedSubjects> = Vec::new();
        for child in rewrite.children {
            let task: BoxedSubjects = match child.child {
                ChildKind::This => Box::pin(subjects_of_direct(
                    ctx.clone(),
                    resource.clone(),
                    subject_type.clone(),
                    depth,
                )),
                ChildKind::ComputedUserset { relation } => lookup_subjects_internal(
                    ctx.clone(),
                    resource.with_relation(&relation),
                    subject_type.clone(),
                    depth.saturating_sub(1),
                ),
                ChildKind::TupleToUserset {
                    tupleset_relation,
                    computed_relation,
                } => Box::pin(subjects_of_arrow(
                    ctx.clone(),
                    resource.clone(),
                    subject_type.clone(),
                    tupleset_relation,
                    computed_relation,
                    depth,
                )),
                ChildKind::Rewrite(nested) => subjects_of_rewrite(
                    ctx.clone(),
                    resource.clone(),
                    subject_type.clone(),
                    *nested,
                    depth,
                ),
                ChildKind::Nil => Box::pin(std::future::ready(Ok(SubjectSet::default()))),
            };
            tasks.push(task);
        }

        let results = join_all_ordered(&ctx, tasks).await?;
        let mut iter = results.into_iter();
        Ok(match rewrite.operation {
            SetOperation::Union => iter.fold(SubjectSet::default(), SubjectSet::union),
            SetOperation::Intersection => match iter.next() {
                Some(first) => iter.fold(first, SubjectSet::intersect),
                None => SubjectSet::default(),
            },
            SetOperation::Exclusion => {
                let base = iter.next().unwrap_or_default();
                match iter.next() {
                    Some(subtract) => base.exclude(subtract),
                    None => base,
                }
            }
        })
    })
}

async fn subjects_of_arrow(
    ctx: Arc<RequestContext>,
    resource: ObjectAndRelation,
    subject_type: String,
    tupleset_relation: String,
    computed_relation: String,
    depth: u32,
) -> Result<SubjectSet> {
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

    let mut tasks: Vec<BoxedSubjects> = Vec::new();
    for edge in edges {
        let intermediate = edge.subject;
        if intermediate.relation != ELLIPSIS {
            continue;
        }
        if ctx
            .schema
            .relation(&intermediate.namespace, &computed_relation)
            .is_none()
        {
            continue;
        }
        let condition = edge.caveat.map(CaveatExpression::caveat);
        let sub = lookup_subjects_internal(
            ctx.clone(),
            intermediate.with_relation(&computed_relation),
            subject_type.clone(),
            depth - 1,
        );
        tasks.push(Box::pin(async move {
            Ok(sub.await?.constrained_by(condition))
        }));
    }

    let mut set = SubjectSet::default();
    for resolved in join_all_ordered(&ctx, tasks).await? {
        set = set.union(resolved);
    }
    Ok(set)
}

/// Run tasks concurrently with bounded fanout, preserving input order in
/// the results (intersection and exclusion are order-sensitive).
async fn join_all_ordered(
    ctx: &Arc<RequestContext>,
    tasks: Vec<BoxedSubjects>,
) -> Result<Vec<SubjectSet>> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let fanout = ctx.config.max_dispatch_fanout.max(1);
    let mut pending = tasks.into_iter().enumerate();
    let mut join_set = JoinSet::new();
    for (index, task) in pending.by_ref().take(fanout) {
        join_set.spawn(async move { (index, task.await) });
    }

    let mut results: Vec<Option<SubjectSet>> = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (index, result) =
            joined.map_err(|e| DispatchError::Internal(format!("lookup task failed: {}", e)))?;
        let value = result?;
        if results.len() <= index {
            results.resize(index + 1, None);
        }
        results[index] = Some(value);
        if let Some((index, task)) = pending.next() {
            join_set.spawn(async move { (index, task.await) });
        }
    }
    Ok(results.into_iter().flatten().collect())
}
