use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid namespace name: {0}")]
    InvalidNamespace(String),

    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("Invalid relation name: {0}")]
    InvalidRelation(String),

    #[error("Invalid caveat name: {0}")]
    InvalidCaveatName(String),

    #[error("Malformed tuple: {0}")]
    MalformedTuple(String),

    #[error("Malformed revision: {0}")]
    MalformedRevision(String),

    #[error("Wildcard subjects cannot carry a relation: {0}")]
    WildcardWithRelation(String),
}
