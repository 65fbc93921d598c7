//! Parallax error taxonomy and exit codes

use std::path::PathBuf;

use sessionstore::StoreError;
use thiserror::Error;

use crate::conflict::ConflictReport;
use crate::domain::Phase;
use crate::git::{GitError, WorktreeError};

/// Exit code for success
pub const EXIT_OK: i32 = 0;
/// Exit code for general failures, including validation errors
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when a phase gate blocks the command
pub const EXIT_GATE_BLOCKED: i32 = 2;
/// Exit code when a lock could not be acquired in time
pub const EXIT_LOCK_TIMEOUT: i32 = 3;
/// Exit code when a conflict blocks a merge
pub const EXIT_CONFLICT_BLOCKED: i32 = 4;

/// One gate that did not pass
#[derive(Debug, Clone, PartialEq)]
pub struct UnmetGate {
    pub gate: String,
    pub reason: String,
}

impl std::fmt::Display for UnmetGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.gate, self.reason)
    }
}

/// Errors surfaced by Parallax operations
#[derive(Debug, Error)]
pub enum PxError {
    /// Malformed input; never retried
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("Timed out waiting for lock '{name}'{}", holder.as_ref().map(|h| format!(" (held by {})", h)).unwrap_or_default())]
    LockTimeout { name: String, holder: Option<String> },

    #[error("{phase} gates not satisfied: {}", unmet.iter().map(|u| u.to_string()).collect::<Vec<_>>().join("; "))]
    GateFailure { phase: Phase, unmet: Vec<UnmetGate> },

    /// Persisted state failed validation; requires an explicit restore
    #[error("Corrupt state at {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("Merge blocked by {} conflicting branch pair(s)", reports.len())]
    ConflictBlocked { reports: Vec<ConflictReport> },

    #[error("Branch name already taken: {0}")]
    NameCollision(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PxError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { path, reason } => PxError::CorruptState { path, reason },
            StoreError::InvalidId(id) => PxError::Validation(format!("invalid identifier: {}", id)),
            other => PxError::Store(other),
        }
    }
}

impl PxError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::GateFailure { .. } => EXIT_GATE_BLOCKED,
            Self::LockTimeout { .. } => EXIT_LOCK_TIMEOUT,
            Self::ConflictBlocked { .. } => EXIT_CONFLICT_BLOCKED,
            _ => EXIT_FAILURE,
        }
    }

    /// Guidance printed under the error message
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => Some("retry shortly, or inspect holders with `px status --verbose`"),
            Self::GateFailure { .. } => Some("produce the missing evidence, or bypass with `px next --force --reason ...`"),
            Self::CorruptState { .. } => Some("state is never repaired automatically; recover with `px restore <snapshot>`"),
            Self::ConflictBlocked { .. } => Some("resolve the overlap, or override with `px merge --force`"),
            Self::Git(e) if e.is_network() => Some("network failure after retries; check connectivity and retry"),
            _ => None,
        }
    }
}

/// Result alias for Parallax operations
pub type PxResult<T> = Result<T, PxError>;
