//! Datastore contract
//!
//! The abstract storage interface the evaluation core consumes: revisioned
//! snapshot readers over relationships and schema definitions, atomic
//! writes, change watching, and an optimized-revision hint for consistency
//! token selection. Ships with an in-memory MVCC implementation used as
//! the test backend and a context-severing proxy that keeps queries alive
//! across caller cancellation.

pub mod error;
pub mod memory;
pub mod proxy;
pub mod traits;
pub mod types;

pub use error::{DatastoreError, Result};
pub use memory::MemoryDatastore;
pub use proxy::SeveredDatastore;
pub use traits::{Datastore, SnapshotReader};
pub use types::{
    Cursor, FeatureSet, QueryOptions, RelationshipsFilter, RevisionChanges, RevisionCheckResult,
    SortOrder, SubjectsFilter, TupleIterator, WatchStream,
};
