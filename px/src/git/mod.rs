//! Repository operations adapter
//!
//! Every git invocation goes through [`GitRunner`], which enforces a hard
//! timeout, classifies failures and retries network-class errors for the
//! transient operations only.

mod merge;
mod runner;
mod worktree;

pub use merge::{MergeResult, MergeStrategy, merge_into};
pub use runner::{GitError, GitOp, GitOutput, GitRunner, classify};
pub(crate) use runner::wait_with_timeout;
pub use worktree::{WorktreeConfig, WorktreeError, WorktreeInfo, WorktreeManager, dir_name_for};
