use colored::Colorize;
use serde_json::json;
use sessionstore::RestoreStats;
use tracing::{debug, info};

use crate::context::{CACHE_BRANCHES, CACHE_CONFLICTS, CACHE_GATES, CACHE_REPO, CACHE_STATUS, Workspace};
use crate::dispatch::Orchestrator;
use crate::domain::{GLOBAL_ID, Session, SessionStatus};
use crate::error::{PxError, PxResult};
use crate::registry::BranchRegistry;

pub fn cmd_clean(ws: &Workspace, actor: &str, dry_run: bool, force: bool) -> PxResult<()> {
    let report = Orchestrator::cleanup().dispatch(ws, actor, dry_run, force);
    if report.actions.is_empty() {
        println!("Nothing to clean");
    }
    let prefix = if dry_run { "[dry-run] " } else { "" };
    for action in &report.actions {
        println!("{}{:<16} {:<48} {}", prefix, action.worker.as_str().dimmed(), action.subject, action.detail);
    }
    for (worker, error) in &report.failures {
        println!("{} {} failed: {}", "error:".red().bold(), worker, error);
    }
    if !report.failures.is_empty() {
        let names: Vec<&str> = report.failures.iter().map(|(w, _)| w.as_str()).collect();
        return Err(PxError::Validation(format!("cleanup incomplete: {}", names.join(", "))));
    }
    Ok(())
}

/// Close and archive a session; its branches stay registered
///
/// Returns the names of branches the session still had active.
pub fn close_session(ws: &Workspace, session_id: &str) -> PxResult<Vec<String>> {
    debug!(%session_id, "close_session: called");
    let mut session: Session = ws.require_session(session_id)?;
    let open: Vec<String> = BranchRegistry::new(ws)
        .list_for_session(session_id)?
        .into_iter()
        .map(|b| b.name)
        .collect();

    session.touch(ws.now());
    session.status = SessionStatus::Closed;
    ws.store.save(&session)?;
    ws.update_global(session_id, |global| {
        global.remove_session(session_id);
        Ok(())
    })?;
    ws.store.archive::<Session>(session_id)?;
    ws.invalidate(&[CACHE_STATUS]);
    info!(%session_id, open_branches = open.len(), "Closed session");
    Ok(open)
}

pub fn cmd_close(ws: &Workspace, session_id: &str) -> PxResult<()> {
    let open = close_session(ws, session_id)?;
    println!("{} session {}", "Closed".green().bold(), session_id);
    for name in open {
        println!(
            "  {} {} is still active; merge it or run `px clean --force`",
            "note:".yellow(),
            name
        );
    }
    Ok(())
}

pub fn cmd_backup(ws: &Workspace) -> PxResult<()> {
    let snapshot = ws.store.backup()?;
    println!(
        "{} {} ({} files, {} bytes)",
        "Snapshot".green().bold(),
        snapshot.name,
        snapshot.files,
        snapshot.bytes
    );
    Ok(())
}

/// Replace records from a snapshot while holding the `global` lock
pub fn restore_state(ws: &Workspace, actor: &str, snapshot: &str) -> PxResult<RestoreStats> {
    debug!(%actor, %snapshot, "restore_state: called");
    let stats = ws.with_lock(GLOBAL_ID, actor, || Ok(ws.store.restore(snapshot)?))?;
    ws.invalidate(&[CACHE_BRANCHES, CACHE_STATUS, CACHE_CONFLICTS, CACHE_GATES, CACHE_REPO]);
    ws.audit(
        actor,
        "state-restore",
        snapshot,
        json!({ "removed": stats.removed, "restored": stats.restored }),
    )?;
    Ok(stats)
}

pub fn cmd_restore(ws: &Workspace, actor: &str, snapshot: &str) -> PxResult<()> {
    let stats = match restore_state(ws, actor, snapshot) {
        Ok(stats) => stats,
        Err(e) => {
            if let Ok(snapshots) = ws.store.list_backups() {
                println!("Available snapshots:");
                for s in snapshots {
                    println!("  {} ({} files)", s.name, s.files);
                }
            }
            return Err(e);
        }
    };
    println!(
        "{} {} ({} files)",
        "Restored".green().bold(),
        snapshot,
        stats.restored
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::start_session;
    use crate::config::Config;
    use crate::domain::Phase;
    use crate::testutil::setup_git_repo;
    use sessionstore::ManualClock;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn workspace(repo: &Path) -> (Workspace, Arc<ManualClock>) {
        setup_git_repo(repo);
        let mut config = Config::default();
        config.git.use_worktrees = false;
        let clock = Arc::new(ManualClock::starting_now());
        (Workspace::open(config, repo, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_close_archives_and_releases_claims() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path());
        let started = start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();

        let open = close_session(&ws, "t1").unwrap();
        assert_eq!(open, vec![started.branch.name.clone()]);
        assert!(!ws.store.exists::<Session>("t1").unwrap());
        let global = ws.load_global().unwrap();
        assert!(!global.active_sessions.contains("t1"));
        assert!(global.claims_of("t1").is_empty());
        assert!(BranchRegistry::new(&ws).require(&started.branch.name).unwrap().is_active());
        assert!(matches!(close_session(&ws, "t1"), Err(PxError::NotFound(_))));
    }

    #[test]
    fn test_backup_then_restore_recovers_corrupt_record() {
        let repo = tempdir().unwrap();
        let (ws, clock) = workspace(repo.path());
        start_session(&ws, "t1", "auth", Some(Phase::P3), None).unwrap();
        let snapshot = ws.store.backup().unwrap();
        clock.advance(Duration::from_secs(1));

        let path = ws.store.path_for::<Session>("t1").unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ws.load_session("t1"), Err(PxError::CorruptState { .. })));

        let stats = restore_state(&ws, "t1", &snapshot.name).unwrap();
        assert!(stats.restored > 0);
        assert_eq!(ws.require_session("t1").unwrap().current_phase, Phase::P3);
        let audit = ws.audit.by_action("state-restore").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].subject, snapshot.name);
    }

    #[test]
    fn test_restore_unknown_snapshot() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path());
        assert!(restore_state(&ws, "t1", "19990101000000").is_err());
        assert!(ws.audit.by_action("state-restore").unwrap().is_empty());
    }
}
