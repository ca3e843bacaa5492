//! Dispatch engine
//!
//! Concurrent graph-traversal evaluation of permissions over stored
//! relationships: Check, Expand, LookupResources, LookupSubjects and
//! ReachableResources. Union and intersection children fan out in
//! parallel with short-circuit cancellation; reverse lookups walk the
//! schema's reachability graphs; sub-results are memoized and
//! single-flighted through a shared request cache.

mod check;
pub mod config;
mod context;
pub mod engine;
pub mod error;
mod expand;
mod lookup_resources;
mod lookup_subjects;
pub mod request;
#[cfg(test)]
mod tests;

pub use config::DispatchConfig;
pub use engine::{DispatchEngine, LookupStream};
pub use error::{DispatchError, Result};
pub use request::{
    CheckRequest, CheckResponse, DispatchMetadata, ExpandRequest, ExpandResponse, ExpandSubject,
    ExpandTree, LookedUpResource, LookedUpSubject, LookupResourcesRequest, LookupSubjectsRequest,
    Membership, ReachableResource,
};
