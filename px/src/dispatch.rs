//! One-level dispatch of maintenance workers
//!
//! An [`Orchestrator`] owns its workers and runs each with a
//! [`WorkerContext`]. The context hands out the stores, the git runner and a
//! branch registry, never the [`Workspace`] itself, and a worker cannot reach
//! the orchestrator or another worker. A dispatch started while another is
//! running on the same thread is refused.

use std::cell::{Cell, RefCell};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sessionstore::{Cache, LockManager, Store};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{CACHE_STATUS, Workspace};
use crate::domain::{Branch, BranchStatus, GlobalState, Session, SessionStatus};
use crate::error::{PxError, PxResult};
use crate::git::{GitRunner, WorktreeManager};
use crate::registry::BranchRegistry;

/// Worker name used for dispatch-level failures
pub const ORCHESTRATOR: &str = "orchestrator";

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as dispatching until dropped
struct DispatchScope;

impl DispatchScope {
    fn enter() -> Option<Self> {
        if DISPATCHING.with(|d| d.replace(true)) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(false));
    }
}

/// One thing a worker did, or would do under dry-run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub worker: String,
    pub subject: String,
    pub detail: String,
}

/// What a worker may see
pub struct WorkerContext<'a> {
    ws: &'a Workspace,
    dry_run: bool,
    force: bool,
    actor: &'a str,
    worker: &'static str,
    sink: &'a RefCell<Vec<Action>>,
}

impl<'a> WorkerContext<'a> {
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn actor(&self) -> &str {
        self.actor
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ws.now()
    }

    pub fn config(&self) -> &Config {
        &self.ws.config
    }

    pub fn store(&self) -> &Store {
        &self.ws.store
    }

    pub fn git(&self) -> &GitRunner {
        &self.ws.git
    }

    pub fn locks(&self) -> &LockManager {
        &self.ws.locks
    }

    pub fn cache(&self) -> &Cache {
        &self.ws.cache
    }

    pub fn worktrees(&self) -> WorktreeManager {
        self.ws.worktrees()
    }

    pub fn registry(&self) -> BranchRegistry<'a> {
        BranchRegistry::new(self.ws)
    }

    pub fn update_global<T>(&self, f: impl FnOnce(&mut GlobalState) -> PxResult<T>) -> PxResult<T> {
        self.ws.update_global(self.actor, f)
    }

    pub fn invalidate(&self, categories: &[&str]) {
        self.ws.invalidate(categories)
    }

    /// Record an action in the run report
    pub fn report(&self, subject: impl Into<String>, detail: impl Into<String>) {
        let action = Action {
            worker: self.worker.to_string(),
            subject: subject.into(),
            detail: detail.into(),
        };
        debug!(worker = %action.worker, subject = %action.subject, detail = %action.detail, "WorkerContext::report");
        self.sink.borrow_mut().push(action);
    }
}

/// A unit of maintenance work
pub trait Worker {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()>;
}

/// Result of one dispatch
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub dry_run: bool,
    pub actions: Vec<Action>,
    /// Worker name and error for workers that failed
    pub failures: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn actions_of(&self, worker: &str) -> Vec<&Action> {
        self.actions.iter().filter(|a| a.worker == worker).collect()
    }
}

/// Owns workers and runs them in order
#[derive(Default)]
pub struct Orchestrator {
    workers: Vec<Box<dyn Worker>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: impl Worker + 'static) -> Self {
        self.workers.push(Box::new(worker));
        self
    }

    /// The workers behind `px clean`
    pub fn cleanup() -> Self {
        Self::new()
            .with_worker(SessionReaper)
            .with_worker(BranchPruner)
            .with_worker(WorktreePruner)
            .with_worker(LockReaper)
            .with_worker(CacheSweeper)
    }

    pub fn worker_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// Run every worker; a failing worker is reported and the rest still run
    ///
    /// Called from inside a running worker, nothing runs and the report
    /// carries a single [`ORCHESTRATOR`] failure.
    pub fn dispatch(&self, ws: &Workspace, actor: &str, dry_run: bool, force: bool) -> DispatchReport {
        debug!(workers = self.workers.len(), dry_run, force, "Orchestrator::dispatch: called");
        let Some(_scope) = DispatchScope::enter() else {
            warn!("Refusing nested dispatch");
            return DispatchReport {
                dry_run,
                actions: Vec::new(),
                failures: vec![(ORCHESTRATOR.to_string(), "nested dispatch refused".to_string())],
            };
        };
        let sink = RefCell::new(Vec::new());
        let mut failures = Vec::new();

        for worker in &self.workers {
            let ctx = WorkerContext {
                ws,
                dry_run,
                force,
                actor,
                worker: worker.name(),
                sink: &sink,
            };
            debug!(worker = worker.name(), "Orchestrator::dispatch: running worker");
            if let Err(e) = worker.run(&ctx) {
                warn!(worker = worker.name(), error = %e, "Worker failed");
                failures.push((worker.name().to_string(), e.to_string()));
            }
        }

        let actions = sink.into_inner();
        info!(actions = actions.len(), failures = failures.len(), dry_run, "Dispatch complete");
        DispatchReport {
            dry_run,
            actions,
            failures,
        }
    }
}

/// Archives sessions idle past `sessions.stale-after-hours`
pub struct SessionReaper;

impl Worker for SessionReaper {
    fn name(&self) -> &'static str {
        "session-reaper"
    }

    fn description(&self) -> &'static str {
        "Archive stale sessions and release their claims"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()> {
        let now = ctx.now();
        let stale_after =
            chrono::Duration::hours(i64::try_from(ctx.config().sessions.stale_after_hours).unwrap_or(i64::MAX / 3600));
        let registry = ctx.registry();

        for session in ctx.store().list::<Session>()? {
            let closed = session.status == SessionStatus::Closed;
            if !closed && session.idle_for(now) <= stale_after {
                continue;
            }
            let id = session.session_id.clone();
            let branches = registry.list_for_session(&id)?;

            for branch in &branches {
                if ctx.force() {
                    ctx.report(&branch.name, "abandon unmerged branch");
                    if !ctx.dry_run() {
                        registry.retire(&branch.name, BranchStatus::Abandoned, ctx.actor())?;
                    }
                } else {
                    ctx.report(&branch.name, "keep unmerged branch (use --force to abandon)");
                }
            }

            let idle_hours = session.idle_for(now).num_hours();
            ctx.report(&id, format!("archive session idle {}h", idle_hours));
            if ctx.dry_run() {
                continue;
            }
            ctx.update_global(|global| {
                global.remove_session(&id);
                Ok(())
            })?;
            ctx.store().archive::<Session>(&id)?;
            info!(session = %id, idle_hours, "Reaped stale session");
        }
        ctx.invalidate(&[CACHE_STATUS]);
        Ok(())
    }
}

/// Deletes git branches of retired records and retires records whose git branch vanished
pub struct BranchPruner;

impl BranchPruner {
    fn prune(&self, ctx: &WorkerContext<'_>, registry: &BranchRegistry<'_>, branch: &Branch) -> PxResult<()> {
        let exists = ctx.git().branch_exists(&branch.name)?;
        if branch.status.is_retired() && exists {
            if ctx.git().current_branch()?.as_deref() == Some(branch.name.as_str()) {
                warn!(name = %branch.name, "Skipping checked-out retired branch");
                return Ok(());
            }
            ctx.report(&branch.name, format!("delete {} branch", branch.status));
            if !ctx.dry_run() {
                // Squash merges leave the branch unreachable from the target
                let force = branch.status == BranchStatus::Abandoned || branch.merge_commit.is_some();
                ctx.git().delete_branch(&branch.name, force)?;
            }
        } else if branch.is_active() && !exists {
            ctx.report(&branch.name, "retire record whose git branch is gone");
            if !ctx.dry_run() {
                registry.retire(&branch.name, BranchStatus::Abandoned, ctx.actor())?;
            }
        }
        Ok(())
    }
}

impl Worker for BranchPruner {
    fn name(&self) -> &'static str {
        "branch-pruner"
    }

    fn description(&self) -> &'static str {
        "Delete retired branches and retire orphaned records"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()> {
        let registry = ctx.registry();
        let mut failed = Vec::new();

        for branch in registry.list_all()? {
            if let Err(e) = self.prune(ctx, &registry, &branch) {
                warn!(name = %branch.name, error = %e, "Could not prune branch");
                ctx.report(&branch.name, format!("failed: {}", e));
                failed.push(branch.name);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PxError::Validation(format!("could not prune {}", failed.join(", "))))
        }
    }
}

/// Removes worktree directories no active branch owns
pub struct WorktreePruner;

impl Worker for WorktreePruner {
    fn name(&self) -> &'static str {
        "worktree-pruner"
    }

    fn description(&self) -> &'static str {
        "Remove worktrees of retired or unknown branches"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()> {
        let active: Vec<String> = ctx
            .registry()
            .list_all()?
            .into_iter()
            .filter(|b| b.is_active())
            .map(|b| b.name)
            .collect();
        for removed in ctx.worktrees().cleanup_orphaned(&active, ctx.dry_run())? {
            ctx.report(removed, "remove orphaned worktree");
        }
        Ok(())
    }
}

/// Breaks locks whose lease expired or whose holder died
pub struct LockReaper;

impl Worker for LockReaper {
    fn name(&self) -> &'static str {
        "lock-reaper"
    }

    fn description(&self) -> &'static str {
        "Break stale locks"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()> {
        if ctx.dry_run() {
            let now = ctx.now();
            for info in ctx.locks().list()?.into_iter().filter(|l| l.is_expired(now)) {
                ctx.report(&info.name, format!("break lease-expired lock held by {}", info.owner));
            }
            return Ok(());
        }
        for info in ctx.locks().break_stale(ctx.actor())? {
            ctx.report(&info.name, format!("broke stale lock held by {}", info.owner));
        }
        Ok(())
    }
}

/// Deletes expired cache entries
pub struct CacheSweeper;

impl Worker for CacheSweeper {
    fn name(&self) -> &'static str {
        "cache-sweeper"
    }

    fn description(&self) -> &'static str {
        "Delete expired cache entries"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> PxResult<()> {
        if ctx.dry_run() {
            return Ok(());
        }
        let removed = ctx.cache().sweep_expired()?;
        if removed > 0 {
            ctx.report("cache", format!("swept {} expired entr{}", removed, if removed == 1 { "y" } else { "ies" }));
        }
        Ok(())
    }
}
