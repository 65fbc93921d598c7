//! Store error types

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from store, lock, cache and audit operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record failed structural validation. The file is left untouched.
    #[error("Corrupt record at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Insufficient disk space: {0}")]
    DiskSpace(String),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Build a closure that wraps an io::Error with the path it happened at
pub(crate) fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
