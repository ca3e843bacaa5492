use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Maximum dispatch depth exhausted")]
    ExhaustedDepth,

    #[error("Datastore unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rebac_schema::SchemaError> for DispatchError {
    fn from(err: rebac_schema::SchemaError) -> Self {
        use rebac_schema::SchemaError;
        match err {
            SchemaError::NamespaceNotFound(_)
            | SchemaError::RelationNotFound { .. }
            | SchemaError::CaveatNotFound(_) => DispatchError::InvalidArgument(err.to_string()),
            SchemaError::Inadmissible(_) => DispatchError::FailedPrecondition(err.to_string()),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

impl From<rebac_datastore::DatastoreError> for DispatchError {
    fn from(err: rebac_datastore::DatastoreError) -> Self {
        use rebac_datastore::DatastoreError;
        match err {
            DatastoreError::InvalidRevision(_) | DatastoreError::StaleRevision(_) => {
                DispatchError::InvalidArgument(err.to_string())
            }
            DatastoreError::AlreadyExists(_) => DispatchError::FailedPrecondition(err.to_string()),
            DatastoreError::Unavailable(message) => DispatchError::Unavailable(message),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

impl From<rebac_models::ModelError> for DispatchError {
    fn from(err: rebac_models::ModelError) -> Self {
        DispatchError::InvalidArgument(err.to_string())
    }
}

impl From<rebac_cache::CacheError> for DispatchError {
    fn from(err: rebac_cache::CacheError) -> Self {
        use rebac_cache::CacheError;
        match err {
            CacheError::RefreshTimeout => DispatchError::DeadlineExceeded,
            CacheError::RefreshFailed(message) => DispatchError::Unavailable(message),
        }
    }
}
