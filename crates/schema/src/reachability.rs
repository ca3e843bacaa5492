//! Reachability graphs
//!
//! For a target relation, precomputes the inverse of its rewrite closure:
//! given a subject type (or subject type + relation), which entrypoints
//! lead toward the target. Reverse lookups walk these entrypoints hop by
//! hop instead of expanding every rewrite forward.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use rebac_models::{ObjectAndRelation, ELLIPSIS};

use crate::definition::{ChildKind, SetOperation, UsersetRewrite};
use crate::error::Result;
use crate::schema::Schema;

/// How a subject takes one hop toward the target relation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntrypointKind {
    /// A stored edge on `target_relation` reaches it directly.
    Relation,
    /// A subject holding the keyed relation also holds `target_relation`
    /// on the same object, with no datastore query.
    ComputedUserset,
    /// A subject holding the computed relation on an intermediate object
    /// reaches `target_relation` on every object whose tupleset edge
    /// points at that intermediate.
    TuplesetToUserset,
}

/// Whether taking this hop alone proves membership, or membership must
/// still be confirmed by a positive check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Every rewrite ancestor of the hop is a union.
    Direct,
    /// The hop sits beneath an intersection or exclusion.
    Conditional,
}

impl ResultStatus {
    pub fn combine(self, other: ResultStatus) -> ResultStatus {
        if self == ResultStatus::Direct && other == ResultStatus::Direct {
            ResultStatus::Direct
        } else {
            ResultStatus::Conditional
        }
    }
}

/// One hop of the reverse-lookup index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entrypoint {
    pub kind: EntrypointKind,
    pub target_namespace: String,
    pub target_relation: String,
    pub result_status: ResultStatus,
    /// For tupleset-to-userset hops, the stored relation whose edges link
    /// resources to intermediate objects.
    pub tupleset_relation: Option<String>,
}

/// The reverse-lookup index for one `(namespace, relation)` target.
#[derive(Debug, Clone)]
pub struct ReachabilityGraph {
    resource_namespace: String,
    resource_relation: String,
    // Keyed by subject namespace (wildcard allowances) or
    // `namespace#relation` (concrete subjects and usersets).
    entrypoints: HashMap<String, Vec<Entrypoint>>,
}

impl ReachabilityGraph {
    /// Walk the rewrite closure of the target relation once, recording
    /// every hop keyed by the subject shapes that can take it.
    pub fn build(schema: &Schema, namespace: &str, relation: &str) -> Result<Self> {
        let mut graph = Self {
            resource_namespace: namespace.to_string(),
            resource_relation: relation.to_string(),
            entrypoints: HashMap::new(),
        };

        let mut queue: VecDeque<(String, String)> =
            VecDeque::from([(namespace.to_string(), relation.to_string())]);
        let mut visited: HashSet<(String, String)> = HashSet::new();

        while let Some((ns, rel)) = queue.pop_front() {
            if !visited.insert((ns.clone(), rel.clone())) {
                continue;
            }
            let definition = schema.relation_or_err(&ns, &rel)?;

            if let Some(info) = &definition.type_information {
                for allowed in &info.allowed_direct_relations {
                    let key = if allowed.wildcard {
                        allowed.namespace.clone()
                    } else {
                        format!(
                            "{}#{}",
                            allowed.namespace,
                            allowed.relation.as_deref().unwrap_or(ELLIPSIS)
                        )
                    };
                    graph.add(
                        key,
                        Entrypoint {
                            kind: EntrypointKind::Relation,
                            target_namespace: ns.clone(),
                            target_relation: rel.clone(),
                            result_status: ResultStatus::Direct,
                            tupleset_relation: None,
                        },
                    );
                    // Userset subjects are reached through their own
                    // relation first.
                    if let Some(subject_relation) = &allowed.relation {
                        queue.push_back((allowed.namespace.clone(), subject_relation.clone()));
                    }
                }
            }

            if let Some(rewrite) = &definition.userset_rewrite {
                graph.walk_rewrite(
                    schema,
                    &ns,
                    &rel,
                    rewrite,
                    ResultStatus::Direct,
                    &mut queue,
                )?;
            }
        }

        Ok(graph)
    }

    fn walk_rewrite(
        &mut self,
        schema: &Schema,
        namespace: &str,
        relation: &str,
        rewrite: &UsersetRewrite,
        status: ResultStatus,
        queue: &mut VecDeque<(String, String)>,
    ) -> Result<()> {
        for child in &rewrite.children {
            let child_status = match rewrite.operation {
                SetOperation::Union => status,
                SetOperation::Intersection | SetOperation::Exclusion => ResultStatus::Conditional,
            };
            match &child.child {
                ChildKind::This | ChildKind::Nil => {}
                ChildKind::ComputedUserset { relation: target } => {
                    self.add(
                        format!("{}#{}", namespace, target),
                        Entrypoint {
                            kind: EntrypointKind::ComputedUserset,
                            target_namespace: namespace.to_string(),
                            target_relation: relation.to_string(),
                            result_status: child_status,
                            tupleset_relation: None,
                        },
                    );
                    queue.push_back((namespace.to_string(), target.clone()));
                }
                ChildKind::TupleToUserset {
                    tupleset_relation,
                    computed_relation,
                } => {
                    for allowed in schema.allowed_direct(namespace, tupleset_relation)? {
                        if allowed.relation.is_some() || allowed.wildcard {
                            continue;
                        }
                        let intermediate = schema.namespace_or_err(&allowed.namespace)?;
                        if intermediate.relation(computed_relation).is_none() {
                            continue;
                        }
                        self.add(
                            format!("{}#{}", allowed.namespace, computed_relation),
                            Entrypoint {
                                kind: EntrypointKind::TuplesetToUserset,
                                target_namespace: namespace.to_string(),
                                target_relation: relation.to_string(),
                                result_status: child_status,
                                tupleset_relation: Some(tupleset_relation.clone()),
                            },
                        );
                        queue.push_back((allowed.namespace.clone(), computed_relation.clone()));
                    }
                }
                ChildKind::Rewrite(nested) => {
                    self.walk_rewrite(schema, namespace, relation, nested, child_status, queue)?;
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, key: String, entrypoint: Entrypoint) {
        let entries = self.entrypoints.entry(key).or_default();
        if !entries.contains(&entrypoint) {
            entries.push(entrypoint);
        }
    }

    pub fn resource_namespace(&self) -> &str {
        &self.resource_namespace
    }

    pub fn resource_relation(&self) -> &str {
        &self.resource_relation
    }

    /// Whether a reached object-and-relation is the lookup target itself.
    pub fn is_target(&self, or: &ObjectAndRelation) -> bool {
        or.namespace == self.resource_namespace && or.relation == self.resource_relation
    }

    /// Entrypoints a concrete subject can take: its type-wide key plus its
    /// `namespace#relation` key.
    pub fn entrypoints_for(&self, subject: &ObjectAndRelation) -> Vec<&Entrypoint> {
        let mut result = Vec::new();
        if let Some(entries) = self.entrypoints.get(&subject.namespace) {
            result.extend(entries.iter());
        }
        if let Some(entries) = self
            .entrypoints
            .get(&format!("{}#{}", subject.namespace, subject.relation))
        {
            result.extend(entries.iter());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AllowedRelation, NamespaceDefinition, Relation};

    fn schema() -> std::sync::Arc<Schema> {
        Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "organization",
                    vec![Relation::stored(
                        "admin",
                        vec![AllowedRelation::plain("user")],
                    )],
                ),
                NamespaceDefinition::new(
                    "document",
                    vec![
                        Relation::stored("org", vec![AllowedRelation::plain("organization")]),
                        Relation::stored("viewer", vec![AllowedRelation::plain("user")]),
                        Relation::stored("banned", vec![AllowedRelation::plain("user")]),
                        Relation::permission(
                            "view",
                            UsersetRewrite::union(vec![
                                ChildKind::computed("viewer"),
                                ChildKind::arrow("org", "admin"),
                            ]),
                        ),
                        Relation::permission(
                            "visible",
                            UsersetRewrite::exclusion(
                                ChildKind::computed("viewer"),
                                ChildKind::computed("banned"),
                            ),
                        ),
                    ],
                ),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_relation_entrypoints_for_plain_subject() {
        let schema = schema();
        let graph = schema.reachability_graph("document", "view").unwrap();
        let subject = ObjectAndRelation::parse("user:alice").unwrap();
        let entrypoints = graph.entrypoints_for(&subject);

        let relations: Vec<_> = entrypoints
            .iter()
            .filter(|e| e.kind == EntrypointKind::Relation)
            .map(|e| {
                format!("{}#{}", e.target_namespace, e.target_relation)
            })
            .collect();
        assert!(relations.contains(&"document#viewer".to_string()));
        assert!(relations.contains(&"organization#admin".to_string()));
    }

    #[test]
    fn test_userset_hops() {
        let schema = schema();
        let graph = schema.reachability_graph("document", "view").unwrap();

        // A subject already holding document#viewer hops to document#view
        // with no query.
        let viewer = ObjectAndRelation::parse("document:readme#viewer").unwrap();
        let hops = graph.entrypoints_for(&viewer);
        assert!(hops
            .iter()
            .any(|e| e.kind == EntrypointKind::ComputedUserset
                && e.target_relation == "view"
                && e.result_status == ResultStatus::Direct));

        // An organization admin hops through the tupleset.
        let admin = ObjectAndRelation::parse("organization:acme#admin").unwrap();
        let hops = graph.entrypoints_for(&admin);
        assert!(hops
            .iter()
            .any(|e| e.kind == EntrypointKind::TuplesetToUserset
                && e.tupleset_relation.as_deref() == Some("org")));
    }

    #[test]
    fn test_conditional_under_exclusion() {
        let schema = schema();
        let graph = schema.reachability_graph("document", "visible").unwrap();
        let viewer = ObjectAndRelation::parse("document:readme#viewer").unwrap();
        let hops = graph.entrypoints_for(&viewer);
        assert!(hops
            .iter()
            .all(|e| e.result_status == ResultStatus::Conditional));
    }

    #[test]
    fn test_recursive_schema_terminates() {
        let schema = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "folder",
                    vec![
                        Relation::stored("parent", vec![AllowedRelation::plain("folder")]),
                        Relation::stored("viewer", vec![AllowedRelation::plain("user")]),
                        Relation::permission(
                            "view",
                            UsersetRewrite::union(vec![
                                ChildKind::computed("viewer"),
                                ChildKind::arrow("parent", "view"),
                            ]),
                        ),
                    ],
                ),
            ],
            vec![],
        )
        .unwrap();
        let graph = schema.reachability_graph("folder", "view").unwrap();
        let target = ObjectAndRelation::parse("folder:root#view").unwrap();
        assert!(graph
            .entrypoints_for(&target)
            .iter()
            .any(|e| e.kind == EntrypointKind::TuplesetToUserset));
    }
}
