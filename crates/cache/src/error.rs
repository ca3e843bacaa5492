use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Revision refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Revision refresh timed out")]
    RefreshTimeout,
}
