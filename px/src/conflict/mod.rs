//! Conflict detection between active branches
//!
//! Runs synchronously when asked (`status`, `publish`, `merge`): merge-base,
//! touched-file intersection, then an in-memory three-way simulation per
//! shared path to grade severity.

mod classify;
mod detector;

pub use classify::{Severity, classify};
pub use detector::{BranchConflicts, ConflictDetector, ConflictReport, FileConflict};
