use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rebac_caveats::BoolExpr;
use rebac_datastore::{Datastore, MemoryDatastore};
use rebac_models::{
    CaveatDefinition, ObjectAndRelation, ParameterType, RelationTuple, RelationshipUpdate,
    Revision,
};
use rebac_schema::{
    AllowedRelation, ChildKind, NamespaceDefinition, Relation, UsersetRewrite,
};

use crate::config::DispatchConfig;
use crate::engine::DispatchEngine;
use crate::error::DispatchError;
use crate::request::{
    CheckRequest, ExpandRequest, LookupResourcesRequest, LookupSubjectsRequest, Membership,
};

fn or(s: &str) -> ObjectAndRelation {
    ObjectAndRelation::parse(s).unwrap()
}

fn tuple(s: &str) -> RelationTuple {
    RelationTuple::parse(s).unwrap()
}

fn ip_in_range_caveat() -> CaveatDefinition {
    CaveatDefinition::new(
        "ip_in_range",
        BoolExpr::in_range("user_ip", "cidr").serialize_bytes(),
        BTreeMap::from([
            ("user_ip".to_string(), ParameterType::String),
            ("cidr".to_string(), ParameterType::IpNetwork),
        ]),
    )
    .unwrap()
}

fn document_namespaces() -> Vec<NamespaceDefinition> {
    vec![
        NamespaceDefinition::new("user", vec![]),
        NamespaceDefinition::new(
            "group",
            vec![Relation::stored(
                "member",
                vec![
                    AllowedRelation::plain("user"),
                    AllowedRelation::userset("group", "member"),
                ],
            )],
        ),
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
                Relation::stored(
                    "viewer",
                    vec![
                        AllowedRelation::plain("user"),
                        AllowedRelation::wildcard("user"),
                        AllowedRelation::userset("group", "member"),
                        AllowedRelation::plain("user").with_caveat("ip_in_range"),
                    ],
                ),
                Relation::stored("owner", vec![AllowedRelation::plain("user")]),
                Relation::stored("banned", vec![AllowedRelation::plain("user")]),
                Relation::permission(
                    "view",
                    UsersetRewrite::union(vec![
                        ChildKind::computed("viewer"),
                        ChildKind::computed("owner"),
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
                Relation::permission(
                    "audited",
                    UsersetRewrite::intersection(vec![
                        ChildKind::computed("viewer"),
                        ChildKind::computed("owner"),
                    ]),
                ),
                Relation::permission("nothing", UsersetRewrite::union(vec![ChildKind::Nil])),
            ],
        ),
    ]
}

async fn engine_with_fixture() -> (DispatchEngine, MemoryDatastore) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = MemoryDatastore::new();
    store.write_schema(document_namespaces(), vec![ip_in_range_caveat()]);
    let engine = DispatchEngine::new(Arc::new(store.clone()), DispatchConfig::default());
    (engine, store)
}

async fn write_all(engine: &DispatchEngine, tuples: &[&str]) -> Revision {
    let updates = tuples
        .iter()
        .map(|s| RelationshipUpdate::touch(tuple(s)))
        .collect();
    engine.write_relationships(updates).await.unwrap()
}

async fn check_at(
    engine: &DispatchEngine,
    resource: &str,
    subject: &str,
    revision: Revision,
) -> Membership {
    engine
        .check(CheckRequest::new(or(resource), or(subject), revision))
        .await
        .unwrap()
        .membership
}

#[tokio::test]
async fn test_direct_viewer_has_view() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r1#viewer@user:alice"]).await;

    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", rev).await,
        Membership::Member
    );
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:mallory", rev).await,
        Membership::NotMember
    );
}

#[tokio::test]
async fn test_org_admin_has_view_through_arrow() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#org@organization:o1",
            "organization:o1#admin@user:bob",
        ],
    )
    .await;

    assert_eq!(
        check_at(&engine, "document:r1#view", "user:bob", rev).await,
        Membership::Member
    );
}

#[tokio::test]
async fn test_group_membership_resolves_through_userset() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@group:eng#member",
            "group:eng#member@group:backend#member",
            "group:backend#member@user:gina",
        ],
    )
    .await;

    assert_eq!(
        check_at(&engine, "document:r1#view", "user:gina", rev).await,
        Membership::Member
    );
}

#[tokio::test]
async fn test_lookup_resources_for_subject() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r2#owner@user:alice",
            "document:r3#viewer@user:someone_else",
        ],
    )
    .await;

    let stream = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "view",
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap();
    let mut ids: Vec<_> = stream
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.resource_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["r1", "r2"]);
}

#[tokio::test]
async fn test_lookup_resources_through_arrow() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#org@organization:o1",
            "organization:o1#admin@user:bob",
        ],
    )
    .await;

    let stream = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "view",
            or("user:bob"),
            rev,
        ))
        .await
        .unwrap();
    let resources = stream.collect_all().await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].resource_id, "r1");
    assert!(!resources[0].conditional);
}

#[tokio::test]
async fn test_lookup_resources_deduplicates() {
    let (engine, _) = engine_with_fixture().await;
    // alice reaches r1 as viewer and as owner; one emission expected.
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#owner@user:alice",
        ],
    )
    .await;

    let stream = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "view",
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap();
    let resources = stream.collect_all().await.unwrap();
    assert_eq!(resources.len(), 1);
}

#[tokio::test]
async fn test_lookup_resources_limit_caps_emissions() {
    let (engine, _) = engine_with_fixture().await;
    let tuples: Vec<String> = (0..20)
        .map(|i| format!("document:doc{:02}#viewer@user:alice", i))
        .collect();
    let refs: Vec<&str> = tuples.iter().map(|s| s.as_str()).collect();
    let rev = write_all(&engine, &refs).await;

    let stream = engine
        .lookup_resources(
            LookupResourcesRequest::new("document", "view", or("user:alice"), rev)
                .with_limit(2),
        )
        .await
        .unwrap();
    let resources = stream.collect_all().await.unwrap();
    assert_eq!(resources.len(), 2);
}

#[tokio::test]
async fn test_lookup_subjects_unions_all_branches() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#org@organization:o1",
            "organization:o1#admin@user:bob",
        ],
    )
    .await;

    let stream = engine
        .lookup_subjects(LookupSubjectsRequest::new(
            or("document:r1#view"),
            "user",
            rev,
        ))
        .await
        .unwrap();
    let mut ids: Vec<_> = stream
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.subject_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_lookup_subjects_through_groups_and_wildcard() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@group:eng#member",
            "group:eng#member@user:gina",
            "document:r1#viewer@user:*",
        ],
    )
    .await;

    let stream = engine
        .lookup_subjects(LookupSubjectsRequest::new(
            or("document:r1#view"),
            "user",
            rev,
        ))
        .await
        .unwrap();
    let ids: Vec<_> = stream
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.subject_id)
        .collect();
    assert!(ids.contains(&"gina".to_string()));
    assert!(ids.contains(&"*".to_string()));
}

#[tokio::test]
async fn test_wildcard_grants_any_subject_of_type() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r2#viewer@user:*"]).await;

    assert_eq!(
        check_at(&engine, "document:r2#view", "user:dave", rev).await,
        Membership::Member
    );
    // Wildcards are type-scoped; other namespaces gain nothing.
    let err = engine
        .check(CheckRequest::new(
            or("document:r2#view"),
            or("organization:dave"),
            rev,
        ))
        .await
        .unwrap()
        .membership;
    assert_eq!(err, Membership::NotMember);
}

#[tokio::test]
async fn test_nil_yields_no_permission() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r1#viewer@user:alice"]).await;

    assert_eq!(
        check_at(&engine, "document:r1#nothing", "user:alice", rev).await,
        Membership::NotMember
    );
}

#[tokio::test]
async fn test_exclusion_blocks_banned_subjects() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#viewer@user:frank",
            "document:r1#banned@user:frank",
        ],
    )
    .await;

    assert_eq!(
        check_at(&engine, "document:r1#visible", "user:alice", rev).await,
        Membership::Member
    );
    assert_eq!(
        check_at(&engine, "document:r1#visible", "user:frank", rev).await,
        Membership::NotMember
    );
}

#[tokio::test]
async fn test_intersection_requires_all_branches() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#owner@user:alice",
            "document:r1#viewer@user:bob",
        ],
    )
    .await;

    assert_eq!(
        check_at(&engine, "document:r1#audited", "user:alice", rev).await,
        Membership::Member
    );
    assert_eq!(
        check_at(&engine, "document:r1#audited", "user:bob", rev).await,
        Membership::NotMember
    );
}

#[tokio::test]
async fn test_reachable_resources_overreports_conditionals() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:frank",
            "document:r1#banned@user:frank",
        ],
    )
    .await;

    // Reachability reports the candidate; the checked lookup rejects it.
    let reachable = engine
        .reachable_resources(LookupResourcesRequest::new(
            "document",
            "visible",
            or("user:frank"),
            rev,
        ))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(reachable.len(), 1);
    assert_eq!(
        reachable[0].status,
        rebac_schema::ResultStatus::Conditional
    );

    let looked_up = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "visible",
            or("user:frank"),
            rev,
        ))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert!(looked_up.is_empty());
}

#[tokio::test]
async fn test_caveated_edge_requires_context() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[r#"document:r1#viewer@user:carol[ip_in_range:{"cidr":"10.0.0.0/8"}]"#],
    )
    .await;

    // No context: conditional on the caveat.
    let membership = check_at(&engine, "document:r1#view", "user:carol", rev).await;
    assert!(matches!(membership, Membership::Conditional(_)));

    // Context satisfying the predicate.
    let membership = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:carol"), rev)
                .with_context("user_ip", serde_json::json!("10.20.30.40")),
        )
        .await
        .unwrap()
        .membership;
    assert_eq!(membership, Membership::Member);

    // Falsifying context.
    let membership = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:carol"), rev)
                .with_context("user_ip", serde_json::json!("192.168.1.1")),
        )
        .await
        .unwrap()
        .membership;
    assert_eq!(membership, Membership::NotMember);
}

#[tokio::test]
async fn test_lookup_resources_marks_unresolved_caveats_conditional() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[r#"document:r1#viewer@user:carol[ip_in_range:{"cidr":"10.0.0.0/8"}]"#],
    )
    .await;

    let resources = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "view",
            or("user:carol"),
            rev,
        ))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert!(resources[0].conditional);

    // With satisfying context the emission is unconditional.
    let resources = engine
        .lookup_resources(
            LookupResourcesRequest::new("document", "view", or("user:carol"), rev)
                .with_context("user_ip", serde_json::json!("10.1.1.1")),
        )
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert!(!resources[0].conditional);
}

#[tokio::test]
async fn test_depth_exhaustion_on_deep_chains() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@group:g1#member",
            "group:g1#member@group:g2#member",
            "group:g2#member@group:g3#member",
            "group:g3#member@user:zoe",
        ],
    )
    .await;

    // Generous budget resolves the chain.
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:zoe", rev).await,
        Membership::Member
    );

    // The chain needs exactly five levels: view, viewer, then one per
    // group hop. One level less exhausts.
    let at_boundary = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:zoe"), rev).with_depth(5),
        )
        .await
        .unwrap();
    assert_eq!(at_boundary.membership, Membership::Member);
    let err = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:zoe"), rev).with_depth(4),
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ExhaustedDepth);

    // Zero budget fails immediately.
    let err = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:zoe"), rev).with_depth(0),
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ExhaustedDepth);
}

#[tokio::test]
async fn test_cyclic_tupleset_bounded_by_depth() {
    let store = MemoryDatastore::new();
    store.write_schema(
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
    );
    let engine = DispatchEngine::new(Arc::new(store), DispatchConfig::default());

    // An adversarial self-parenting folder cycles until depth runs out.
    let rev = engine
        .write_relationships(vec![RelationshipUpdate::touch(tuple(
            "folder:f1#parent@folder:f1",
        ))])
        .await
        .unwrap();
    let err = engine
        .check(CheckRequest::new(or("folder:f1#view"), or("user:zoe"), rev))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ExhaustedDepth);

    // A well-formed hierarchy resolves within budget.
    let rev = engine
        .write_relationships(vec![
            RelationshipUpdate::touch(tuple("folder:child#parent@folder:root")),
            RelationshipUpdate::touch(tuple("folder:root#viewer@user:zoe")),
        ])
        .await
        .unwrap();
    assert_eq!(
        check_at(&engine, "folder:child#view", "user:zoe", rev).await,
        Membership::Member
    );
}

#[tokio::test]
async fn test_check_is_deterministic() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:frank",
            "document:r1#banned@user:frank",
            "document:r1#org@organization:o1",
            "organization:o1#admin@user:frank",
        ],
    )
    .await;

    let first = check_at(&engine, "document:r1#visible", "user:frank", rev).await;
    for _ in 0..10 {
        assert_eq!(
            check_at(&engine, "document:r1#visible", "user:frank", rev).await,
            first
        );
    }
}

#[tokio::test]
async fn test_snapshot_reads_are_monotone() {
    let (engine, _) = engine_with_fixture().await;
    let r1 = write_all(&engine, &["document:r1#viewer@user:alice"]).await;
    let r2 = write_all(&engine, &["document:r1#viewer@user:bob"]).await;

    // Both revisions see alice; only the later sees bob.
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", r1).await,
        Membership::Member
    );
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", r2).await,
        Membership::Member
    );
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:bob", r1).await,
        Membership::NotMember
    );
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:bob", r2).await,
        Membership::Member
    );
}

#[tokio::test]
async fn test_write_round_trip() {
    let (engine, _) = engine_with_fixture().await;
    let edge = tuple("document:r1#viewer@user:alice");

    let created = engine
        .write_relationships(vec![RelationshipUpdate::create(edge.clone())])
        .await
        .unwrap();
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", created).await,
        Membership::Member
    );

    // CREATE of the same key fails; TOUCH is idempotent.
    let err = engine
        .write_relationships(vec![RelationshipUpdate::create(edge.clone())])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::FailedPrecondition(_)));
    engine
        .write_relationships(vec![RelationshipUpdate::touch(edge.clone())])
        .await
        .unwrap();

    let deleted = engine
        .write_relationships(vec![RelationshipUpdate::delete(edge)])
        .await
        .unwrap();
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", deleted).await,
        Membership::NotMember
    );
    // The earlier snapshot still answers from its revision.
    assert_eq!(
        check_at(&engine, "document:r1#view", "user:alice", created).await,
        Membership::Member
    );
}

#[tokio::test]
async fn test_writes_validated_against_schema() {
    let (engine, _) = engine_with_fixture().await;

    // Permissions never bear stored edges.
    let err = engine
        .write_relationships(vec![RelationshipUpdate::touch(tuple(
            "document:r1#view@user:alice",
        ))])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::FailedPrecondition(_)));

    // Subject types must be enumerated by the relation.
    let err = engine
        .write_relationships(vec![RelationshipUpdate::touch(tuple(
            "document:r1#owner@organization:o1",
        ))])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_unknown_revision_rejected() {
    let (engine, _) = engine_with_fixture().await;
    let err = engine
        .check(CheckRequest::new(
            or("document:r1#view"),
            or("user:alice"),
            Revision::new(999),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_unknown_relation_rejected() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r1#viewer@user:alice"]).await;
    let err = engine
        .check(CheckRequest::new(
            or("document:r1#launch"),
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_expand_materializes_rewrite_tree() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#owner@user:olga",
            "document:r1#org@organization:o1",
            "organization:o1#admin@user:bob",
        ],
    )
    .await;

    let response = engine
        .expand(ExpandRequest::new(or("document:r1#view"), rev))
        .await
        .unwrap();
    let subjects: Vec<String> = response
        .tree
        .flatten_subjects()
        .into_iter()
        .map(|s| s.subject.to_string())
        .collect();
    assert!(subjects.contains(&"user:alice".to_string()));
    assert!(subjects.contains(&"user:olga".to_string()));
    assert!(subjects.contains(&"user:bob".to_string()));
}

#[tokio::test]
async fn test_expand_agrees_with_check() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r1#owner@user:olga",
        ],
    )
    .await;

    let response = engine
        .expand(ExpandRequest::new(or("document:r1#view"), rev))
        .await
        .unwrap();
    for subject in response.tree.flatten_subjects() {
        if subject.caveat.is_none() && subject.subject.relation == rebac_models::ELLIPSIS {
            assert_eq!(
                check_at(
                    &engine,
                    "document:r1#view",
                    &subject.subject.to_string(),
                    rev
                )
                .await,
                Membership::Member
            );
        }
    }
}

#[tokio::test]
async fn test_second_check_is_served_from_cache() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r1#viewer@user:alice"]).await;

    let first = engine
        .check(CheckRequest::new(
            or("document:r1#view"),
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap();
    assert!(first.metadata.dispatch_count > 0);

    let second = engine
        .check(CheckRequest::new(
            or("document:r1#view"),
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap();
    assert_eq!(second.membership, first.membership);
    assert!(second.metadata.cached_dispatch_count > 0);
    assert!(second.metadata.dispatch_count < first.metadata.dispatch_count);
}

#[tokio::test]
async fn test_lookup_reachability_has_no_false_negatives() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(
        &engine,
        &[
            "document:r1#viewer@user:alice",
            "document:r2#owner@user:alice",
            "document:r3#org@organization:o1",
            "organization:o1#admin@user:alice",
            "document:r4#viewer@group:eng#member",
            "group:eng#member@user:alice",
        ],
    )
    .await;

    let resources = engine
        .lookup_resources(LookupResourcesRequest::new(
            "document",
            "view",
            or("user:alice"),
            rev,
        ))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let mut ids: Vec<_> = resources.into_iter().map(|r| r.resource_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["r1", "r2", "r3", "r4"]);

    // Everything looked up checks out at the same revision.
    for id in ids {
        let membership = check_at(
            &engine,
            &format!("document:{}#view", id),
            "user:alice",
            rev,
        )
        .await;
        assert_eq!(membership, Membership::Member);
    }
}

#[tokio::test]
async fn test_deadline_is_honored() {
    let (engine, _) = engine_with_fixture().await;
    let rev = write_all(&engine, &["document:r1#viewer@user:alice"]).await;

    // A deadline that already passed cannot be met.
    let err = engine
        .check(
            CheckRequest::new(or("document:r1#view"), or("user:alice"), rev)
                .with_deadline(Duration::ZERO),
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::DeadlineExceeded);
}

#[tokio::test]
async fn test_optimized_revision_follows_head() -> anyhow::Result<()> {
    let (engine, store) = engine_with_fixture().await;
    let head = store.head_revision().await?;
    assert_eq!(engine.optimized_revision().await?, head);
    Ok(())
}
