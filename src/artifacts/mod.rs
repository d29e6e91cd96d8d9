//! Artifact Store
//!
//! Per-task artifact state and the merge rules applied at joins.
//!
//! - [`snapshot`]: Copy-on-write artifact mapping owned by one task
//! - [`merge`]: Join-time aggregation with conflict detection

pub mod merge;
pub mod snapshot;

pub use merge::{merge, Conflicts, MergeOutcome};
pub use snapshot::{ArtifactError, Snapshot, INPUT_KEY};
