// Core modules
pub mod caveat;
pub mod error;
pub mod object;
pub mod revision;
pub mod tuple;
pub mod update;

// Re-export commonly used types
pub use caveat::{
    CaveatDefinition, CaveatExpression, CaveatOperator, ContextualizedCaveat, ParameterType,
};
pub use error::{ModelError, Result};
pub use object::{ObjectAndRelation, ELLIPSIS, WILDCARD};
pub use revision::Revision;
pub use tuple::RelationTuple;
pub use update::{RelationshipUpdate, UpdateOperation};
