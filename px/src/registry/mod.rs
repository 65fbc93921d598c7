//! Branch registry
//!
//! Creates, looks up and retires branches. Names are unique for the lifetime
//! of the state directory: GlobalState remembers every name ever registered,
//! and registration happens under the `global` lock so two sessions racing
//! for one name produce exactly one winner.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::{CACHE_BRANCHES, CACHE_CONFLICTS, CACHE_STATUS, Workspace};
use crate::domain::naming::{self, NameRequest, validate_branch_name};
use crate::domain::{Branch, BranchStatus, Phase, PublishInfo, RecordedConflict, validate_session_id};
use crate::error::{PxError, PxResult};

/// Inputs for [`BranchRegistry::create`]
#[derive(Debug, Clone)]
pub struct CreateBranch {
    pub name: String,
    pub session_id: String,
    pub phase: Phase,
    pub description: String,
    /// Fork point; the integration branch when `None`
    pub base: Option<String>,
}

/// Registry of branches backed by the shared state directory
pub struct BranchRegistry<'a> {
    ws: &'a Workspace,
}

impl<'a> BranchRegistry<'a> {
    pub fn new(ws: &'a Workspace) -> Self {
        Self { ws }
    }

    fn is_taken(&self, name: &str, known: &dyn Fn(&str) -> bool) -> PxResult<bool> {
        Ok(known(name) || self.ws.store.exists::<Branch>(name)? || self.ws.git.branch_exists(name)?)
    }

    /// Render a fresh, unused name from the configured pattern
    pub fn generate_name(&self, phase: Phase, session_id: &str, description: &str) -> PxResult<String> {
        debug!(%phase, %session_id, %description, "BranchRegistry::generate_name: called");
        validate_session_id(session_id).map_err(PxError::Validation)?;
        let global = self.ws.load_global()?;
        let naming = &self.ws.config.naming;
        let req = NameRequest {
            pattern: &naming.pattern,
            prefix: &naming.prefix,
            phase,
            session_id,
            description,
            at: self.ws.now(),
        };
        let known = |n: &str| global.is_known(n);
        let name = naming::generate(&req, |n| self.is_taken(n, &known))?.ok_or_else(|| {
            PxError::NameCollision(format!(
                "all {} candidates for session '{}'",
                naming::MAX_NAME_SUFFIX,
                session_id
            ))
        })?;
        validate_branch_name(&name).map_err(PxError::Validation)?;
        Ok(name)
    }

    /// Register a branch: git branch, optional worktree, record, GlobalState
    pub fn create(&self, req: &CreateBranch) -> PxResult<Branch> {
        debug!(?req, "BranchRegistry::create: called");
        validate_branch_name(&req.name).map_err(PxError::Validation)?;
        validate_session_id(&req.session_id).map_err(PxError::Validation)?;
        let base = req
            .base
            .clone()
            .unwrap_or_else(|| self.ws.config.integration_branch.clone());
        if !self.ws.git.branch_exists(&base)? {
            return Err(PxError::NotFound(format!("base branch '{}'", base)));
        }
        let max_active = self.ws.config.sessions.max_active_branches;

        let branch = self.ws.update_global(&req.session_id, |global| {
            if self.is_taken(&req.name, &|n| global.is_known(n))? {
                return Err(PxError::NameCollision(req.name.clone()));
            }
            let active = global.claims_of(&req.session_id).len();
            if active >= max_active {
                return Err(PxError::Validation(format!(
                    "session '{}' already has {} active branch(es); the limit is {}",
                    req.session_id, active, max_active
                )));
            }

            self.ws.git.create_branch(&req.name, &base)?;
            let mut branch = Branch::new(&req.name, &req.session_id, req.phase, &base, &req.description, self.ws.now());
            if base != self.ws.config.integration_branch {
                branch.dependencies.push(base.clone());
            }

            if self.ws.config.git.use_worktrees {
                match self.ws.worktrees().create(&req.name) {
                    Ok(info) => branch.worktree = Some(info.path.to_string_lossy().to_string()),
                    Err(e) => {
                        if let Err(del) = self.ws.git.delete_branch(&req.name, true) {
                            warn!(name = %req.name, error = %del, "Could not roll back branch after worktree failure");
                        }
                        return Err(e.into());
                    }
                }
            }

            self.ws.store.save(&branch)?;
            global.register_session(&req.session_id);
            global.register_branch(&req.name, &req.session_id);
            Ok(branch)
        })?;

        self.ws.invalidate(&[CACHE_BRANCHES, CACHE_STATUS, CACHE_CONFLICTS]);
        info!(name = %branch.name, session = %branch.session_id, "Registered branch");
        Ok(branch)
    }

    /// Mark a branch merged or abandoned; the record is retained
    pub fn retire(&self, name: &str, outcome: BranchStatus, actor: &str) -> PxResult<Branch> {
        debug!(%name, %outcome, %actor, "BranchRegistry::retire: called");
        if !outcome.is_retired() {
            return Err(PxError::Validation("retire outcome must be merged or abandoned".to_string()));
        }
        let mut branch = self.require(name)?;
        if branch.status.is_retired() {
            debug!(%name, "BranchRegistry::retire: already retired");
            return Ok(branch);
        }

        self.ws.update_global(actor, |global| {
            branch.retire(outcome, self.ws.now());
            self.ws.store.save(&branch)?;
            global.retire_branch(name, outcome);
            Ok(())
        })?;

        if outcome == BranchStatus::Abandoned {
            self.ws
                .audit(actor, "branch-abandoned", name, json!({ "session": branch.session_id }))?;
        }
        self.ws.invalidate(&[CACHE_BRANCHES, CACHE_STATUS, CACHE_CONFLICTS]);
        info!(%name, %outcome, "Retired branch");
        Ok(branch)
    }

    pub fn get(&self, name: &str) -> PxResult<Option<Branch>> {
        Ok(self.ws.store.load::<Branch>(name)?)
    }

    pub fn require(&self, name: &str) -> PxResult<Branch> {
        self.get(name)?
            .ok_or_else(|| PxError::NotFound(format!("branch '{}'", name)))
    }

    /// Every branch record, retired ones included
    pub fn list_all(&self) -> PxResult<Vec<Branch>> {
        Ok(self.ws.store.list::<Branch>()?)
    }

    /// Active branches, served from the `branches` cache when fresh
    pub fn list_active(&self) -> PxResult<Vec<Branch>> {
        self.ws.cache.get_or_insert_with(CACHE_BRANCHES, "active", false, || {
            Ok(self.list_all()?.into_iter().filter(Branch::is_active).collect())
        })
    }

    pub fn list_for_session(&self, session_id: &str) -> PxResult<Vec<Branch>> {
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|b| b.session_id == session_id)
            .collect())
    }

    /// Record publish metadata; only the owning session calls this
    pub fn mark_published(&self, name: &str, info: PublishInfo) -> PxResult<Branch> {
        let mut branch = self.require(name)?;
        branch.published = Some(info);
        self.ws.store.save(&branch)?;
        self.ws.invalidate(&[CACHE_BRANCHES, CACHE_STATUS]);
        Ok(branch)
    }

    /// Replace the recorded overlaps; only the owning session calls this
    pub fn record_conflicts(&self, name: &str, conflicts: Vec<RecordedConflict>) -> PxResult<Branch> {
        let mut branch = self.require(name)?;
        if branch.conflicts == conflicts {
            return Ok(branch);
        }
        branch.conflicts = conflicts;
        self.ws.store.save(&branch)?;
        self.ws.invalidate(&[CACHE_BRANCHES]);
        Ok(branch)
    }

    /// Record the commit a merge produced
    pub fn set_merge_commit(&self, name: &str, commit: &str) -> PxResult<Branch> {
        let mut branch = self.require(name)?;
        branch.merge_commit = Some(commit.to_string());
        self.ws.store.save(&branch)?;
        Ok(branch)
    }
}
