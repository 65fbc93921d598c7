use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::touch_session;
use crate::conflict::{ConflictDetector, ConflictReport, FileConflict, Severity};
use crate::context::{INTEGRATION_LOCK, Workspace};
use crate::domain::{Branch, BranchStatus};
use crate::error::{PxError, PxResult};
use crate::git::{MergeResult, MergeStrategy, merge_into};
use crate::registry::BranchRegistry;

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub squash: bool,
    /// Keep the git branch and worktree
    pub no_delete: bool,
    /// Merge despite manual conflicts with the integration branch
    pub force: bool,
    pub reason: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub branch: Branch,
    pub target: String,
    pub commit: String,
    /// Overlaps with sibling branches, reported as warnings
    pub warnings: Vec<ConflictReport>,
    /// A manual conflict was overridden with `--force`
    pub overridden: bool,
    pub deleted: bool,
}

/// Merge `name` into the integration branch under the `integration` lock
///
/// The conflict check bypasses the cache. Manual conflicts against the
/// integration branch refuse the merge unless forced; sibling overlaps only warn.
pub fn merge_branch(ws: &Workspace, name: &str, opts: &MergeOptions) -> PxResult<MergeReport> {
    debug!(%name, ?opts, "merge_branch: called");
    let registry = BranchRegistry::new(ws);
    let branch = registry.require(name)?;
    if !branch.is_active() {
        return Err(PxError::Validation(format!("branch '{}' is already {}", name, branch.status)));
    }
    let target = ws.config.integration_branch.clone();

    let mut report = ws.with_lock(INTEGRATION_LOCK, &opts.actor, || {
        let siblings: Vec<String> = registry.list_active()?.into_iter().map(|b| b.name).collect();
        let conflicts = ConflictDetector::new(&ws.git, &ws.cache).check_branch(name, &siblings, &target, true)?;

        let overridden = conflicts.blocks_merge();
        if overridden {
            if !opts.force {
                return Err(PxError::ConflictBlocked {
                    reports: conflicts.integration.into_iter().collect(),
                });
            }
            let paths: Vec<&str> = conflicts.integration.iter().flat_map(|r| r.paths()).collect();
            ws.audit(
                &opts.actor,
                "conflict-override",
                name,
                json!({ "target": target, "paths": paths, "reason": opts.reason }),
            )?;
            warn!(%name, ?paths, "Merging over manual conflicts");
        }

        let strategy = if opts.squash {
            MergeStrategy::Squash
        } else {
            MergeStrategy::NoFastForward
        };
        let message = if branch.description.is_empty() {
            format!("Merge {}", name)
        } else {
            format!("Merge {}: {}", name, branch.description)
        };
        let commit = match merge_into(&ws.git, name, &target, strategy, &message)? {
            MergeResult::Success { commit } => commit,
            MergeResult::Conflict { files, .. } => {
                return Err(PxError::ConflictBlocked {
                    reports: vec![ConflictReport {
                        branch_a: name.to_string(),
                        branch_b: target.clone(),
                        merge_base: None,
                        conflicting_files: files
                            .into_iter()
                            .map(|path| FileConflict {
                                path,
                                severity: Severity::Manual,
                            })
                            .collect(),
                        severity: Severity::Manual,
                    }],
                });
            }
        };

        registry.set_merge_commit(name, &commit)?;
        let retired = registry.retire(name, BranchStatus::Merged, &opts.actor)?;
        Ok(MergeReport {
            branch: retired,
            target: target.clone(),
            commit,
            warnings: conflicts.siblings,
            overridden,
            deleted: false,
        })
    })?;

    if !opts.no_delete {
        report.deleted = remove_merged(ws, &report.branch, opts.squash);
    }
    touch_session(ws, &opts.actor);
    info!(%name, commit = %report.commit, "Merged branch");
    Ok(report)
}

/// Remove the worktree and git branch of a merged branch; failures only warn
fn remove_merged(ws: &Workspace, branch: &Branch, squash: bool) -> bool {
    if branch.worktree.is_some()
        && let Err(e) = ws.worktrees().remove(&branch.name)
    {
        warn!(name = %branch.name, error = %e, "Could not remove worktree");
    }
    match ws.git.delete_branch(&branch.name, squash) {
        Ok(()) => true,
        Err(e) => {
            warn!(name = %branch.name, error = %e, "Could not delete merged branch");
            false
        }
    }
}

pub fn cmd_merge(ws: &Workspace, name: &str, opts: &MergeOptions) -> PxResult<()> {
    let report = merge_branch(ws, name, opts)?;
    for c in &report.warnings {
        let other = if c.branch_a == name { &c.branch_b } else { &c.branch_a };
        println!(
            "{} {} also touches {}",
            "warning:".yellow().bold(),
            other,
            c.paths().join(", ")
        );
    }
    if report.overridden {
        println!("{} merged over manual conflicts (audited)", "warning:".yellow().bold());
    }
    println!(
        "{} {} into {} at {}",
        "Merged".green().bold(),
        name.cyan(),
        report.target,
        &report.commit[..report.commit.len().min(10)]
    );
    if report.deleted {
        println!("  deleted branch {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::start_session;
    use crate::config::Config;
    use crate::domain::Phase;
    use crate::testutil::{commit_file, setup_git_repo};
    use sessionstore::ManualClock;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn workspace(repo: &Path) -> Workspace {
        setup_git_repo(repo);
        let mut config = Config::default();
        config.git.use_worktrees = false;
        Workspace::open(config, repo, Arc::new(ManualClock::starting_now())).unwrap()
    }

    fn opts(actor: &str) -> MergeOptions {
        MergeOptions {
            actor: actor.to_string(),
            ..MergeOptions::default()
        }
    }

    #[test]
    fn test_merge_retires_only_the_merged_branch() {
        let repo = tempdir().unwrap();
        let ws = workspace(repo.path());
        let a = start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();
        let b = start_session(&ws, "t2", "billing", Some(Phase::P3), None).unwrap();
        commit_file(repo.path(), &a.branch.name, "auth.rs", "fn auth() {}\n", "auth");
        commit_file(repo.path(), &b.branch.name, "billing.rs", "fn bill() {}\n", "bill");

        let report = merge_branch(&ws, &a.branch.name, &opts("t1")).unwrap();
        assert_eq!(report.branch.status, BranchStatus::Merged);
        assert_eq!(report.branch.merge_commit.as_deref(), Some(report.commit.as_str()));
        assert!(report.deleted);
        assert!(!ws.git.branch_exists(&a.branch.name).unwrap());
        assert_eq!(ws.git.show_file("main", "auth.rs").unwrap().as_deref(), Some("fn auth() {}\n"));

        let other = BranchRegistry::new(&ws).require(&b.branch.name).unwrap();
        assert!(other.is_active());
        let global = ws.load_global().unwrap();
        assert_eq!(global.totals.merged, 1);
        assert!(global.active_branches.contains(&b.branch.name));
        assert!(ws.locks.holder(INTEGRATION_LOCK).unwrap().is_none());
    }

    #[test]
    fn test_manual_conflict_with_integration_blocks() {
        let repo = tempdir().unwrap();
        let ws = workspace(repo.path());
        let a = start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();
        commit_file(repo.path(), &a.branch.name, "shared.txt", "ours\n", "ours");
        commit_file(repo.path(), "main", "shared.txt", "theirs\n", "theirs");

        let err = merge_branch(&ws, &a.branch.name, &opts("t1")).unwrap_err();
        assert!(matches!(err, PxError::ConflictBlocked { ref reports } if reports.len() == 1));
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFLICT_BLOCKED);
        assert!(BranchRegistry::new(&ws).require(&a.branch.name).unwrap().is_active());
        assert!(ws.locks.holder(INTEGRATION_LOCK).unwrap().is_none());
    }

    #[test]
    fn test_forced_merge_over_conflict_reports_git_conflict() {
        let repo = tempdir().unwrap();
        let ws = workspace(repo.path());
        let a = start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();
        commit_file(repo.path(), &a.branch.name, "shared.txt", "ours\n", "ours");
        commit_file(repo.path(), "main", "shared.txt", "theirs\n", "theirs");

        let forced = MergeOptions {
            force: true,
            reason: Some("take ours later".to_string()),
            ..opts("t1")
        };
        let err = merge_branch(&ws, &a.branch.name, &forced).unwrap_err();
        assert!(matches!(err, PxError::ConflictBlocked { .. }));
        assert_eq!(ws.audit.by_action("conflict-override").unwrap().len(), 1);
        assert!(!ws.git.is_dirty().unwrap());
        assert!(BranchRegistry::new(&ws).require(&a.branch.name).unwrap().is_active());
    }

    #[test]
    fn test_no_delete_keeps_branch_and_retired_merge_refused() {
        let repo = tempdir().unwrap();
        let ws = workspace(repo.path());
        let a = start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();
        commit_file(repo.path(), &a.branch.name, "auth.rs", "x\n", "auth");

        let keep = MergeOptions {
            no_delete: true,
            squash: true,
            ..opts("t1")
        };
        let report = merge_branch(&ws, &a.branch.name, &keep).unwrap();
        assert!(!report.deleted);
        assert!(ws.git.branch_exists(&a.branch.name).unwrap());
        assert!(matches!(
            merge_branch(&ws, &a.branch.name, &opts("t1")),
            Err(PxError::Validation(_))
        ));
    }
}
