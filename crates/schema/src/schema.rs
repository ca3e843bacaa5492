use dashmap::DashMap;
use rebac_models::{CaveatDefinition, ObjectAndRelation, RelationTuple, ELLIPSIS};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::canonical::{compute_keys, CanonicalKey};
use crate::definition::{
    AllowedRelation, ChildKind, NamespaceDefinition, Relation, SetOperation, UsersetRewrite,
};
use crate::error::{Result, SchemaError};
use crate::reachability::ReachabilityGraph;

/// The compiled, immutable form of a schema at one revision. Built once per
/// request from the definitions read at the chosen revision and shared by
/// reference; the dispatch engine never mutates it.
pub struct Schema {
    namespaces: HashMap<String, Arc<NamespaceDefinition>>,
    caveats: HashMap<String, Arc<CaveatDefinition>>,
    // Memoized reverse-lookup indexes, keyed by canonical key so that
    // semantically identical relations share one graph.
    reachability: DashMap<CanonicalKey, Arc<ReachabilityGraph>>,
}

impl Schema {
    /// Validate and index a set of definitions.
    pub fn compile(
        namespaces: Vec<NamespaceDefinition>,
        caveats: Vec<CaveatDefinition>,
    ) -> Result<Arc<Self>> {
        let mut caveat_index = HashMap::new();
        for caveat in caveats {
            caveat_index.insert(caveat.name.clone(), Arc::new(caveat));
        }

        let mut namespace_index: HashMap<String, NamespaceDefinition> = HashMap::new();
        for mut namespace in namespaces {
            if namespace_index.contains_key(&namespace.name) {
                return Err(SchemaError::DuplicateNamespace(namespace.name));
            }
            assign_operation_paths(&mut namespace);
            let name = namespace.name.clone();
            namespace_index.insert(name, namespace);
        }

        for namespace in namespace_index.values() {
            validate_namespace(namespace, &namespace_index, &caveat_index)?;
        }

        // Canonical keys and aliases, after validation guarantees acyclic
        // permission references.
        let mut compiled = HashMap::new();
        for (name, mut namespace) in namespace_index {
            let keys = compute_keys(&namespace)?;
            for relation in &mut namespace.relations {
                relation.canonical_cache_key = keys.get(&relation.name).copied();
                relation.aliasing_relation = alias_target(relation);
            }
            compiled.insert(name, Arc::new(namespace));
        }

        tracing::debug!(
            "Compiled schema with {} namespaces and {} caveats",
            compiled.len(),
            caveat_index.len()
        );

        Ok(Arc::new(Self {
            namespaces: compiled,
            caveats: caveat_index,
            reachability: DashMap::new(),
        }))
    }

    pub fn namespace(&self, name: &str) -> Option<&Arc<NamespaceDefinition>> {
        self.namespaces.get(name)
    }

    pub fn namespace_or_err(&self, name: &str) -> Result<&Arc<NamespaceDefinition>> {
        self.namespace(name)
            .ok_or_else(|| SchemaError::NamespaceNotFound(name.to_string()))
    }

    pub fn relation(&self, namespace: &str, relation: &str) -> Option<&Relation> {
        self.namespaces.get(namespace)?.relation(relation)
    }

    pub fn relation_or_err(&self, namespace: &str, relation: &str) -> Result<&Relation> {
        self.namespace_or_err(namespace)?
            .relation(relation)
            .ok_or_else(|| SchemaError::RelationNotFound {
                namespace: namespace.to_string(),
                relation: relation.to_string(),
            })
    }

    pub fn caveat(&self, name: &str) -> Option<&Arc<CaveatDefinition>> {
        self.caveats.get(name)
    }

    pub fn caveat_or_err(&self, name: &str) -> Result<&Arc<CaveatDefinition>> {
        self.caveat(name)
            .ok_or_else(|| SchemaError::CaveatNotFound(name.to_string()))
    }

    pub fn is_permission(&self, namespace: &str, relation: &str) -> Result<bool> {
        Ok(self.relation_or_err(namespace, relation)?.is_permission())
    }

    pub fn allowed_direct(&self, namespace: &str, relation: &str) -> Result<&[AllowedRelation]> {
        let relation = self.relation_or_err(namespace, relation)?;
        Ok(relation
            .type_information
            .as_ref()
            .map(|info| info.allowed_direct_relations.as_slice())
            .unwrap_or(&[]))
    }

    /// Stable content hash of the relation's extension-producing definition.
    pub fn canonical_key(&self, namespace: &str, relation: &str) -> Result<CanonicalKey> {
        let relation = self.relation_or_err(namespace, relation)?;
        relation
            .canonical_cache_key
            .ok_or_else(|| SchemaError::RelationNotFound {
                namespace: namespace.to_string(),
                relation: relation.name.clone(),
            })
    }

    /// The reverse-lookup index for a relation, memoized under its
    /// canonical key.
    pub fn reachability_graph(
        &self,
        namespace: &str,
        relation: &str,
    ) -> Result<Arc<ReachabilityGraph>> {
        let key = self.canonical_key(namespace, relation)?;
        if let Some(graph) = self.reachability.get(&key) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(ReachabilityGraph::build(self, namespace, relation)?);
        self.reachability.insert(key, graph.clone());
        Ok(graph)
    }

    /// Write-path admissibility: the resource relation must be a stored
    /// relation and the subject must match one of its allowed types,
    /// including wildcard and caveat requirements.
    pub fn check_admissible(&self, tuple: &RelationTuple) -> Result<()> {
        let relation = self.relation_or_err(&tuple.resource.namespace, &tuple.resource.relation)?;
        if relation.is_permission() {
            return Err(SchemaError::Inadmissible(format!(
                "{} is a permission and cannot bear stored edges",
                tuple.resource.relation_ref()
            )));
        }

        let caveat_name = tuple.caveat.as_ref().map(|c| c.caveat_name.as_str());
        if let Some(name) = caveat_name {
            self.caveat_or_err(name)?;
        }

        let allowed = self.allowed_direct(&tuple.resource.namespace, &tuple.resource.relation)?;
        let matched = allowed.iter().any(|entry| {
            entry.matches_subject(&tuple.subject)
                && entry.required_caveat.as_deref() == caveat_name
        });
        if matched {
            Ok(())
        } else {
            Err(SchemaError::Inadmissible(format!(
                "subject {} is not an allowed type for {}",
                tuple.subject,
                tuple.resource.relation_ref()
            )))
        }
    }
}

impl AllowedRelation {
    /// Whether a concrete subject reference matches this allowed type.
    pub fn matches_subject(&self, subject: &ObjectAndRelation) -> bool {
        if self.namespace != subject.namespace {
            return false;
        }
        if subject.is_wildcard() {
            return self.wildcard;
        }
        match &self.relation {
            Some(relation) => subject.relation == *relation,
            None => subject.relation == ELLIPSIS && !self.wildcard,
        }
    }
}

fn alias_target(relation: &Relation) -> Option<String> {
    let rewrite = relation.userset_rewrite.as_ref()?;
    if rewrite.operation != SetOperation::Union || rewrite.children.len() != 1 {
        return None;
    }
    match &rewrite.children[0].child {
        ChildKind::ComputedUserset { relation } => Some(relation.clone()),
        _ => None,
    }
}

fn assign_operation_paths(namespace: &mut NamespaceDefinition) {
    fn walk(rewrite: &mut UsersetRewrite, prefix: &[u32]) {
        for (index, child) in rewrite.children.iter_mut().enumerate() {
            let mut path = prefix.to_vec();
            path.push(index as u32);
            if let ChildKind::Rewrite(nested) = &mut child.child {
                walk(nested, &path);
            }
            child.operation_path = path;
        }
    }
    for relation in &mut namespace.relations {
        if let Some(rewrite) = &mut relation.userset_rewrite {
            walk(rewrite, &[]);
        }
    }
}

fn validate_namespace(
    namespace: &NamespaceDefinition,
    all: &HashMap<String, NamespaceDefinition>,
    caveats: &HashMap<String, Arc<CaveatDefinition>>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for relation in &namespace.relations {
        if !seen.insert(relation.name.as_str()) {
            return Err(SchemaError::DuplicateRelation {
                namespace: namespace.name.clone(),
                relation: relation.name.clone(),
            });
        }
        match (&relation.type_information, &relation.userset_rewrite) {
            (None, None) => {
                return Err(SchemaError::MissingDefinition {
                    namespace: namespace.name.clone(),
                    relation: relation.name.clone(),
                })
            }
            (Some(_), Some(_)) => {
                return Err(SchemaError::PermissionWithStoredTypes {
                    namespace: namespace.name.clone(),
                    relation: relation.name.clone(),
                })
            }
            _ => {}
        }

        if let Some(info) = &relation.type_information {
            for allowed in &info.allowed_direct_relations {
                validate_allowed(namespace, relation, allowed, all, caveats)?;
            }
        }
        if let Some(rewrite) = &relation.userset_rewrite {
            validate_rewrite(namespace, relation, rewrite, all)?;
        }
    }

    detect_rewrite_cycles(namespace)?;
    Ok(())
}

fn validate_allowed(
    namespace: &NamespaceDefinition,
    relation: &Relation,
    allowed: &AllowedRelation,
    all: &HashMap<String, NamespaceDefinition>,
    caveats: &HashMap<String, Arc<CaveatDefinition>>,
) -> Result<()> {
    if allowed.wildcard && allowed.relation.is_some() {
        return Err(SchemaError::WildcardWithSubjectRelation {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
        });
    }
    let subject_ns = all
        .get(&allowed.namespace)
        .ok_or_else(|| SchemaError::UnknownAllowedType {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
            subject: allowed.namespace.clone(),
        })?;
    if let Some(subject_relation) = &allowed.relation {
        if subject_ns.relation(subject_relation).is_none() {
            return Err(SchemaError::UnknownAllowedType {
                namespace: namespace.name.clone(),
                relation: relation.name.clone(),
                subject: format!("{}#{}", allowed.namespace, subject_relation),
            });
        }
    }
    if let Some(caveat) = &allowed.required_caveat {
        if !caveats.contains_key(caveat) {
            return Err(SchemaError::CaveatNotFound(caveat.clone()));
        }
    }
    Ok(())
}

fn validate_rewrite(
    namespace: &NamespaceDefinition,
    relation: &Relation,
    rewrite: &UsersetRewrite,
    all: &HashMap<String, NamespaceDefinition>,
) -> Result<()> {
    if rewrite.operation == SetOperation::Exclusion && rewrite.children.len() != 2 {
        return Err(SchemaError::ExclusionArity {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
            found: rewrite.children.len(),
        });
    }

    for child in &rewrite.children {
        match &child.child {
            ChildKind::This | ChildKind::Nil => {}
            ChildKind::ComputedUserset { relation: target } => {
                if namespace.relation(target).is_none() {
                    return Err(SchemaError::RelationNotFound {
                        namespace: namespace.name.clone(),
                        relation: target.clone(),
                    });
                }
            }
            ChildKind::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => {
                validate_arrow(namespace, relation, tupleset_relation, computed_relation, all)?;
            }
            ChildKind::Rewrite(nested) => {
                validate_rewrite(namespace, relation, nested, all)?;
            }
        }
    }
    Ok(())
}

fn validate_arrow(
    namespace: &NamespaceDefinition,
    relation: &Relation,
    tupleset_relation: &str,
    computed_relation: &str,
    all: &HashMap<String, NamespaceDefinition>,
) -> Result<()> {
    let tupleset =
        namespace
            .relation(tupleset_relation)
            .ok_or_else(|| SchemaError::RelationNotFound {
                namespace: namespace.name.clone(),
                relation: tupleset_relation.to_string(),
            })?;
    if tupleset.is_permission() {
        return Err(SchemaError::TuplesetNotStored {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
            tupleset: tupleset_relation.to_string(),
        });
    }

    let allowed = tupleset
        .type_information
        .as_ref()
        .map(|info| info.allowed_direct_relations.as_slice())
        .unwrap_or(&[]);
    if allowed.iter().any(|a| a.wildcard) {
        return Err(SchemaError::TuplesetWildcard {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
            tupleset: tupleset_relation.to_string(),
        });
    }

    // The arrow target must exist on at least one intermediate object type.
    let target_exists = allowed.iter().any(|a| {
        all.get(&a.namespace)
            .map(|ns| ns.relation(computed_relation).is_some())
            .unwrap_or(false)
    });
    if !target_exists {
        return Err(SchemaError::ArrowTargetNotFound {
            namespace: namespace.name.clone(),
            relation: relation.name.clone(),
            computed: computed_relation.to_string(),
        });
    }
    Ok(())
}

/// Reject `computed_userset` chains between permissions that never pass
/// through a stored relation or a tuple-to-userset arrow.
fn detect_rewrite_cycles(namespace: &NamespaceDefinition) -> Result<()> {
    fn permission_refs(rewrite: &UsersetRewrite, out: &mut Vec<String>) {
        for child in &rewrite.children {
            match &child.child {
                ChildKind::ComputedUserset { relation } => out.push(relation.clone()),
                ChildKind::Rewrite(nested) => permission_refs(nested, out),
                _ => {}
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        namespace: &NamespaceDefinition,
        name: &str,
        marks: &mut HashMap<String, Mark>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(SchemaError::RewriteCycle {
                    namespace: namespace.name.clone(),
                    relation: name.to_string(),
                })
            }
            None => {}
        }
        let relation = match namespace.relation(name) {
            Some(relation) => relation,
            None => return Ok(()), // unknown refs reported elsewhere
        };
        let rewrite = match &relation.userset_rewrite {
            Some(rewrite) => rewrite,
            // Stored relations break the chain.
            None => {
                marks.insert(name.to_string(), Mark::Done);
                return Ok(());
            }
        };
        marks.insert(name.to_string(), Mark::Visiting);
        let mut refs = Vec::new();
        permission_refs(rewrite, &mut refs);
        for target in refs {
            visit(namespace, &target, marks)?;
        }
        marks.insert(name.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for relation in &namespace.relations {
        visit(namespace, &relation.name, &mut marks)?;
    }
    Ok(())
}
