use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("Relationship already exists: {0}")]
    AlreadyExists(String),

    #[error("Revision {0} is not known to the datastore")]
    InvalidRevision(String),

    #[error("Revision {0} has been garbage collected")]
    StaleRevision(String),

    #[error("Datastore unavailable: {0}")]
    Unavailable(String),

    #[error("Watch disabled or closed")]
    WatchUnavailable,

    #[error("Internal datastore error: {0}")]
    Internal(String),
}
