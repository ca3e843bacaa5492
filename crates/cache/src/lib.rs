//! Caches for consistency tokens and dispatch results
//!
//! - [`CachedOptimizedRevision`]: advertises a shared "optimized" revision
//!   with single-flight refresh, so many requests agree on one consistency
//!   token and downstream caches stay hot.
//! - [`RequestCache`]: memoizes sub-dispatch results and de-duplicates
//!   identical computations that are in flight concurrently.

pub mod error;
pub mod request;
pub mod revision;

pub use error::{CacheError, Result};
pub use request::{CacheStats, RequestCache};
pub use revision::{CachedOptimizedRevision, RevisionCacheConfig};
