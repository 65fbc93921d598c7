//! Merging finished branches into the integration branch

use tracing::{info, warn};

use super::runner::{GitError, GitOp, GitRunner};

/// Result of a merge operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Merge committed on the target
    Success { commit: String },
    /// Git stopped on conflicts; the merge was aborted and the target is unchanged
    Conflict { files: Vec<String>, message: String },
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// How a branch is folded into the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Always create a merge commit
    NoFastForward,
    /// Collapse the branch into a single commit
    Squash,
}

/// Merge `branch` into `target` in the canonical repository root
///
/// This function:
/// 1. Refuses to run over uncommitted changes in the repository root
/// 2. Switches the repository root to `target`
/// 3. Merges with `--no-ff` or `--squash` plus a commit
/// 4. On conflict, aborts and reports the conflicting paths
/// 5. Switches back to the branch that was checked out before
pub fn merge_into(
    git: &GitRunner,
    branch: &str,
    target: &str,
    strategy: MergeStrategy,
    message: &str,
) -> Result<MergeResult, GitError> {
    info!(%branch, %target, ?strategy, "Starting merge");

    if git.is_dirty()? {
        return Err(GitError::Conflict {
            op: GitOp::Merge,
            message: format!("uncommitted changes in {}; commit or stash first", git.dir().display()),
        });
    }

    let previous = git.current_branch()?;
    git.run(GitOp::Checkout, &[target])?;

    let result = match strategy {
        MergeStrategy::NoFastForward => {
            let out = git.run_unchecked(GitOp::Merge, &["--no-ff", "-m", message, branch])?;
            if out.success {
                None
            } else {
                Some((out, ["--abort"]))
            }
        }
        MergeStrategy::Squash => {
            let out = git.run_unchecked(GitOp::Merge, &["--squash", branch])?;
            if out.success {
                git.run(GitOp::Commit, &["--allow-empty", "-m", message])?;
                None
            } else {
                Some((out, ["--merge"]))
            }
        }
    };

    let outcome = match result {
        None => MergeResult::Success {
            commit: git.rev_parse("HEAD")?,
        },
        Some((out, abort_args)) => {
            let combined = format!("{}{}", out.stdout, out.stderr);
            if !combined.contains("CONFLICT") {
                restore_branch(git, previous.as_deref(), target);
                return Err(super::runner::classify(GitOp::Merge, &out));
            }
            let files = git
                .run_unchecked(GitOp::Diff, &["--name-only", "--diff-filter=U"])?
                .lines();
            warn!(%branch, ?files, "Merge conflict detected");
            let abort_op = if strategy == MergeStrategy::Squash { GitOp::Reset } else { GitOp::Merge };
            if let Err(e) = git.run(abort_op, &abort_args) {
                warn!(error = %e, "Failed to abort merge");
            }
            MergeResult::Conflict {
                files,
                message: combined.trim().to_string(),
            }
        }
    };

    restore_branch(git, previous.as_deref(), target);
    if let MergeResult::Success { commit } = &outcome {
        info!(%branch, %target, %commit, "Merge completed");
    }
    Ok(outcome)
}

fn restore_branch(git: &GitRunner, previous: Option<&str>, target: &str) {
    if let Some(previous) = previous
        && previous != target
        && let Err(e) = git.run(GitOp::Checkout, &[previous])
    {
        warn!(%previous, error = %e, "Could not switch back after merge");
    }
}
