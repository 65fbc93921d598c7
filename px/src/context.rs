//! Per-process view of the shared state directory

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sessionstore::{AuditEntry, AuditLog, Cache, LockManager, SharedClock, Store};
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::{Branch, GLOBAL_ID, GlobalState, Session};
use crate::error::{PxError, PxResult};
use crate::git::{GitRunner, WorktreeConfig, WorktreeManager};

/// Cache category for branch listings
pub const CACHE_BRANCHES: &str = "branches";
/// Cache category for rendered status data
pub const CACHE_STATUS: &str = "status";
/// Cache category for conflict reports
pub const CACHE_CONFLICTS: &str = "conflicts";
/// Cache category for gate results
pub const CACHE_GATES: &str = "gates";
/// Cache category for immutable repository facts (merge-bases)
pub const CACHE_REPO: &str = "repo";

/// Lock serialising merges into the integration branch
pub const INTEGRATION_LOCK: &str = "integration";

const AUDIT_FILE: &str = "audit.jsonl";

/// Everything a command needs, opened once per process
#[derive(Debug)]
pub struct Workspace {
    pub config: Config,
    pub repo_root: PathBuf,
    pub state_root: PathBuf,
    pub store: Store,
    pub locks: LockManager,
    pub cache: Cache,
    pub git: GitRunner,
    pub audit: AuditLog,
    clock: SharedClock,
}

impl Workspace {
    /// Open (creating if needed) the state directory for `repo_root`
    pub fn open(config: Config, repo_root: impl Into<PathBuf>, clock: SharedClock) -> PxResult<Self> {
        let repo_root = repo_root.into();
        let state_root = config.state_root(&repo_root);
        debug!(?repo_root, ?state_root, "Workspace::open: called");

        fs::create_dir_all(&state_root).map_err(|e| PxError::Validation(format!("{}: {}", state_root.display(), e)))?;
        ensure_gitignore(&state_root);

        let store = Store::open(&state_root, clock.clone())?.with_backup_excludes(["worktrees", "evidence"]);
        let audit = AuditLog::new(state_root.join(AUDIT_FILE));
        let locks = LockManager::new(state_root.join("locks"), clock.clone())?
            .with_lease(Duration::from_secs(config.locks.lease_secs))
            .with_audit(audit.clone());

        let mut cache = Cache::new(state_root.join("cache"), clock.clone())?
            .with_default_ttl(Duration::from_secs(config.cache.default_ttl_secs))
            .with_ttl_override(CACHE_GATES, Duration::from_secs(config.cache.gate_ttl_secs));
        for (category, secs) in &config.cache.ttl_overrides {
            cache = cache.with_ttl_override(category.clone(), Duration::from_secs(*secs));
        }

        let git = GitRunner::new(&repo_root).with_limits(
            Duration::from_secs(config.git.timeout_secs),
            Duration::from_secs(config.git.network_timeout_secs),
            config.git.max_retries,
        );

        Ok(Self {
            config,
            repo_root,
            state_root,
            store,
            locks,
            cache,
            git,
            audit,
            clock,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.config.evidence_dir(&self.state_root)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_root.join("logs")
    }

    pub fn worktrees(&self) -> WorktreeManager {
        WorktreeManager::new(
            WorktreeConfig {
                base_dir: self.config.worktree_dir(&self.state_root),
                repo_root: self.repo_root.clone(),
                min_disk_space_mb: self.config.git.min_disk_space_mb,
            },
            self.git.clone(),
        )
    }

    /// Directory a branch's files are checked out in
    pub fn work_dir(&self, branch: &Branch) -> PathBuf {
        match &branch.worktree {
            Some(path) if Path::new(path).exists() => PathBuf::from(path),
            _ => self.repo_root.clone(),
        }
    }

    /// Run `f` while holding lock `name` for `owner`
    pub fn with_lock<T>(&self, name: &str, owner: &str, f: impl FnOnce() -> PxResult<T>) -> PxResult<T> {
        let guard = self.locks.lock(name, owner, self.config.lock_timeout())?;
        if guard.is_none() {
            let holder = self.locks.holder(name).ok().flatten().map(|info| info.owner);
            return Err(PxError::LockTimeout {
                name: name.to_string(),
                holder,
            });
        }
        f()
    }

    /// Current GlobalState, or an empty one before the first write
    pub fn load_global(&self) -> PxResult<GlobalState> {
        Ok(self
            .store
            .load::<GlobalState>(GLOBAL_ID)?
            .unwrap_or_else(|| GlobalState::new(self.now())))
    }

    /// Load, mutate and save GlobalState under the `global` lock
    pub fn update_global<T>(&self, owner: &str, f: impl FnOnce(&mut GlobalState) -> PxResult<T>) -> PxResult<T> {
        self.with_lock(GLOBAL_ID, owner, || {
            let mut global = self.load_global()?;
            let out = f(&mut global)?;
            global.updated_at = self.now();
            self.store.save(&global)?;
            Ok(out)
        })
    }

    pub fn load_session(&self, session_id: &str) -> PxResult<Option<Session>> {
        Ok(self.store.load::<Session>(session_id)?)
    }

    pub fn require_session(&self, session_id: &str) -> PxResult<Session> {
        self.load_session(session_id)?
            .ok_or_else(|| PxError::NotFound(format!("session '{}' (run `px start` first)", session_id)))
    }

    /// Append an audit entry
    pub fn audit(&self, actor: &str, action: &str, subject: &str, detail: serde_json::Value) -> PxResult<()> {
        let entry = AuditEntry::new(self.now(), actor, action, subject).with_detail(detail);
        self.audit.append(&entry)?;
        Ok(())
    }

    /// Drop cached categories after a mutation; the cache is never authoritative
    pub fn invalidate(&self, categories: &[&str]) {
        if let Err(e) = self.cache.invalidate_all(categories) {
            warn!(?categories, error = %e, "Workspace::invalidate: cache invalidation failed");
        }
    }
}

fn ensure_gitignore(state_root: &Path) {
    let path = state_root.join(".gitignore");
    if !path.exists()
        && let Err(e) = fs::write(&path, "*\n")
    {
        warn!(?path, error = %e, "Could not write .gitignore for state directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionstore::{ManualClock, system_clock};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let repo = tempdir().unwrap();
        let ws = Workspace::open(Config::default(), repo.path(), system_clock()).unwrap();

        assert_eq!(ws.state_root, repo.path().join(".parallax"));
        assert_eq!(fs::read_to_string(ws.state_root.join(".gitignore")).unwrap(), "*\n");
        assert_eq!(ws.cache.ttl_for(CACHE_GATES), Duration::from_secs(60));
        assert_eq!(ws.cache.ttl_for(CACHE_BRANCHES), Duration::from_secs(300));
    }

    #[test]
    fn test_ttl_overrides_apply() {
        let repo = tempdir().unwrap();
        let mut config = Config::default();
        config.cache.ttl_overrides.insert("repo".to_string(), 900);
        let ws = Workspace::open(config, repo.path(), system_clock()).unwrap();
        assert_eq!(ws.cache.ttl_for(CACHE_REPO), Duration::from_secs(900));
    }

    #[test]
    fn test_update_global_persists_and_releases() {
        let repo = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let ws = Workspace::open(Config::default(), repo.path(), clock.clone()).unwrap();

        ws.update_global("t1", |g| {
            g.register_session("t1");
            Ok(())
        })
        .unwrap();

        let global = ws.load_global().unwrap();
        assert!(global.active_sessions.contains("t1"));
        assert_eq!(global.totals.sessions_started, 1);
        assert!(ws.locks.holder(GLOBAL_ID).unwrap().is_none());
    }

    #[test]
    fn test_with_lock_times_out_with_holder() {
        let repo = tempdir().unwrap();
        let mut config = Config::default();
        config.locks.timeout_ms = 50;
        let ws = Workspace::open(config, repo.path(), system_clock()).unwrap();

        assert!(ws.locks.acquire(GLOBAL_ID, "t2", Duration::from_millis(10)).unwrap().is_some());
        let err = ws.with_lock(GLOBAL_ID, "t1", || Ok(())).unwrap_err();
        match err {
            PxError::LockTimeout { name, holder } => {
                assert_eq!(name, GLOBAL_ID);
                assert_eq!(holder.as_deref(), Some("t2"));
            }
            other => panic!("expected lock timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_with_lock_excludes_second_process_of_same_terminal() {
        let repo = tempdir().unwrap();
        let mut config = Config::default();
        config.locks.timeout_ms = 50;
        let first = Workspace::open(config.clone(), repo.path(), system_clock()).unwrap();
        let second = Workspace::open(config, repo.path(), system_clock()).unwrap();

        let held = first.locks.acquire(GLOBAL_ID, "t1", Duration::from_millis(10)).unwrap().unwrap();
        let err = second.with_lock(GLOBAL_ID, "t1", || Ok(())).unwrap_err();
        assert!(matches!(err, PxError::LockTimeout { .. }));
        assert_eq!(first.locks.holder(GLOBAL_ID).unwrap().unwrap().token, held.token);
    }

    #[test]
    fn test_require_session_not_found() {
        let repo = tempdir().unwrap();
        let ws = Workspace::open(Config::default(), repo.path(), system_clock()).unwrap();
        assert!(matches!(ws.require_session("t9"), Err(PxError::NotFound(_))));
    }
}
