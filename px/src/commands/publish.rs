use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info};

use super::{recorded, session_branch, touch_session};
use crate::conflict::{BranchConflicts, ConflictDetector, ConflictReport};
use crate::context::Workspace;
use crate::domain::{Branch, PublishInfo};
use crate::error::{PxError, PxResult};
use crate::git::GitOp;
use crate::registry::BranchRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub branch: Branch,
    pub conflicts: BranchConflicts,
}

/// Report overlaps, push the session's branch and record publish metadata
pub fn publish_branch(ws: &Workspace, session_id: &str, draft: bool, base: Option<String>) -> PxResult<PublishReport> {
    debug!(%session_id, draft, ?base, "publish_branch: called");
    let (_, name) = session_branch(ws, session_id)?;
    let registry = BranchRegistry::new(ws);
    let branch = registry.require(&name)?;
    if !branch.is_active() {
        return Err(PxError::Validation(format!("branch '{}' is {}", name, branch.status)));
    }
    let base = base.unwrap_or_else(|| branch.base.clone());
    if !ws.git.branch_exists(&base)? {
        return Err(PxError::NotFound(format!("base branch '{}'", base)));
    }

    let siblings: Vec<String> = registry.list_active()?.into_iter().map(|b| b.name).collect();
    let conflicts = ConflictDetector::new(&ws.git, &ws.cache).check_branch(&name, &siblings, &base, false)?;
    let found: Vec<&ConflictReport> = conflicts.all().collect();
    registry.record_conflicts(&name, recorded(&name, &found, ws))?;

    let remote = ws.config.remote.clone();
    if !ws.git.has_remote(&remote)? {
        return Err(PxError::Validation(format!("remote '{}' is not configured", remote)));
    }
    ws.git.run(GitOp::Push, &["-u", &remote, &name])?;

    let branch = registry.mark_published(
        &name,
        PublishInfo {
            remote,
            draft,
            base,
            at: ws.now(),
        },
    )?;
    touch_session(ws, session_id);
    info!(branch = %name, draft, "Published branch");
    Ok(PublishReport { branch, conflicts })
}

pub fn cmd_publish(ws: &Workspace, session_id: &str, draft: bool, base: Option<String>) -> PxResult<()> {
    let report = publish_branch(ws, session_id, draft, base)?;
    for c in report.conflicts.all() {
        let other = if c.branch_a == report.branch.name { &c.branch_b } else { &c.branch_a };
        println!(
            "{} overlaps {} [{}]: {}",
            "warning:".yellow().bold(),
            other,
            c.severity,
            c.paths().join(", ")
        );
    }
    if let Some(info) = &report.branch.published {
        let kind = if info.draft { "draft " } else { "" };
        println!(
            "{} {} to {} ({}targets {})",
            "Published".green().bold(),
            report.branch.name.cyan(),
            info.remote,
            kind,
            info.base
        );
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
    use std::process::Command;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn workspace(repo: &Path) -> Workspace {
        setup_git_repo(repo);
        let mut config = Config::default();
        config.git.use_worktrees = false;
        config.git.max_retries = 0;
        Workspace::open(config, repo, Arc::new(ManualClock::starting_now())).unwrap()
    }

    fn add_remote(repo: &Path, remote: &Path) {
        let ok = Command::new("git")
            .args(["init", "--bare", "-q"])
            .arg(remote)
            .status()
            .unwrap()
            .success();
        assert!(ok);
        let ok = Command::new("git")
            .args(["remote", "add", "origin"])
            .arg(remote)
            .current_dir(repo)
            .status()
            .unwrap()
            .success();
        assert!(ok);
    }

    #[test]
    fn test_publish_pushes_and_records() {
        let repo = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let ws = workspace(repo.path());
        add_remote(repo.path(), remote.path());
        let started = start_session(&ws, "t1", "auth", Some(Phase::P5), None).unwrap();
        commit_file(repo.path(), &started.branch.name, "auth.rs", "fn auth() {}\n", "auth");

        let report = publish_branch(&ws, "t1", true, None).unwrap();
        let info = report.branch.published.unwrap();
        assert!(info.draft);
        assert_eq!(info.remote, "origin");
        assert_eq!(info.base, "main");
        assert!(report.conflicts.all().next().is_none());

        let remote_git = crate::git::GitRunner::new(remote.path());
        assert!(remote_git.branch_exists(&started.branch.name).unwrap());
    }

    #[test]
    fn test_publish_without_remote_fails_before_recording() {
        let repo = tempdir().unwrap();
        let ws = workspace(repo.path());
        let started = start_session(&ws, "t1", "auth", Some(Phase::P5), None).unwrap();

        assert!(matches!(publish_branch(&ws, "t1", false, None), Err(PxError::Validation(_))));
        let branch = BranchRegistry::new(&ws).require(&started.branch.name).unwrap();
        assert!(branch.published.is_none());
    }

    #[test]
    fn test_publish_records_sibling_overlap() {
        let repo = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let ws = workspace(repo.path());
        add_remote(repo.path(), remote.path());
        let a = start_session(&ws, "t1", "auth", Some(Phase::P5), None).unwrap();
        let b = start_session(&ws, "t2", "billing", Some(Phase::P3), None).unwrap();
        commit_file(repo.path(), &a.branch.name, "config.txt", "one\n", "a");
        commit_file(repo.path(), &b.branch.name, "config.txt", "two\n", "b");

        let report = publish_branch(&ws, "t1", false, None).unwrap();
        assert_eq!(report.conflicts.siblings.len(), 1);
        assert!(report.conflicts.integration.is_none());
        assert_eq!(report.branch.conflicts[0].other, b.branch.name);
    }
}
