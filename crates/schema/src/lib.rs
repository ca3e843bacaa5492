//! Compiled schema model
//!
//! Turns namespace and caveat definitions into an immutable, indexed
//! [`Schema`] handle:
//! - namespace / relation / caveat lookup and admissibility checks
//! - userset-rewrite validation (unknown references, rewrite cycles,
//!   malformed tuple-to-userset arrows)
//! - canonical cache keys for semantically equivalent permissions
//! - per-relation reachability graphs for reverse lookups

pub mod canonical;
pub mod definition;
pub mod error;
pub mod reachability;
mod schema;

pub use canonical::CanonicalKey;
pub use definition::{
    AllowedRelation, ChildKind, NamespaceDefinition, Relation, RewriteChild, SetOperation,
    TypeInformation, UsersetRewrite,
};
pub use error::{Result, SchemaError};
pub use reachability::{Entrypoint, EntrypointKind, ReachabilityGraph, ResultStatus};
pub use schema::Schema;
