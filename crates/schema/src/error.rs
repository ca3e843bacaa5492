use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Relation not found: {namespace}#{relation}")]
    RelationNotFound { namespace: String, relation: String },

    #[error("Caveat not found: {0}")]
    CaveatNotFound(String),

    #[error("Duplicate namespace: {0}")]
    DuplicateNamespace(String),

    #[error("Duplicate relation {relation} in namespace {namespace}")]
    DuplicateRelation { namespace: String, relation: String },

    #[error("Relation {namespace}#{relation} must define either stored types or a rewrite")]
    MissingDefinition { namespace: String, relation: String },

    #[error("Permission {namespace}#{relation} cannot also enumerate stored subject types")]
    PermissionWithStoredTypes { namespace: String, relation: String },

    #[error("Rewrite cycle through {namespace}#{relation}")]
    RewriteCycle { namespace: String, relation: String },

    #[error("Exclusion in {namespace}#{relation} requires exactly two operands, found {found}")]
    ExclusionArity {
        namespace: String,
        relation: String,
        found: usize,
    },

    #[error("Tupleset relation {tupleset} of {namespace}#{relation} must be a stored relation")]
    TuplesetNotStored {
        namespace: String,
        relation: String,
        tupleset: String,
    },

    #[error("Tupleset relation {tupleset} of {namespace}#{relation} cannot allow wildcard subjects")]
    TuplesetWildcard {
        namespace: String,
        relation: String,
        tupleset: String,
    },

    #[error(
        "Relation {computed} arrowed from {namespace}#{relation} exists on none of the tupleset subject types"
    )]
    ArrowTargetNotFound {
        namespace: String,
        relation: String,
        computed: String,
    },

    #[error("Allowed subject type {subject} of {namespace}#{relation} is unknown")]
    UnknownAllowedType {
        namespace: String,
        relation: String,
        subject: String,
    },

    #[error("Wildcard subject type on {namespace}#{relation} cannot carry a subject relation")]
    WildcardWithSubjectRelation { namespace: String, relation: String },

    #[error("Edge not admissible: {0}")]
    Inadmissible(String),

    #[error("Invalid model: {0}")]
    Model(#[from] rebac_models::ModelError),
}
