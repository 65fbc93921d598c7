//! Gated, forward-biased phase state machine

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::hooks::{HookContext, PhaseHooks, ShellHooks};
use crate::context::{CACHE_STATUS, Workspace};
use crate::domain::{Phase, PhaseChange, Session, SessionStatus, TransitionKind};
use crate::error::{PxError, PxResult, UnmetGate};
use crate::gates::{GateValidator, PhaseValidation};
use crate::registry::BranchRegistry;

/// Caller intent for a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Bypass failing gates, non-skippable phases, or move backward
    pub force: bool,
    /// Report the outcome without writing anything
    pub dry_run: bool,
    pub actor: String,
    /// Required whenever `force` overrides something
    pub reason: Option<String>,
}

impl TransitionOptions {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Self::default()
        }
    }
}

/// What a transition did, or would do under `dry_run`
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub session_id: String,
    pub from: Phase,
    pub to: Phase,
    pub kind: TransitionKind,
    /// False for dry runs
    pub applied: bool,
    /// Phases jumped over
    pub skipped: Vec<Phase>,
    pub validation: Option<PhaseValidation>,
    /// Failing gates overridden by `force`
    #[serde(skip)]
    pub bypassed: Vec<UnmetGate>,
    /// The terminal phase was completed
    pub completed: bool,
}

/// Phase engine over one workspace
pub struct PhaseEngine<'a> {
    ws: &'a Workspace,
    validator: GateValidator<'a>,
    hooks: Box<dyn PhaseHooks + 'a>,
}

impl<'a> PhaseEngine<'a> {
    pub fn new(ws: &'a Workspace) -> Self {
        Self {
            ws,
            validator: GateValidator::new(ws),
            hooks: Box::new(ShellHooks::from_config(&ws.config.hooks)),
        }
    }

    pub fn with_parts(ws: &'a Workspace, validator: GateValidator<'a>, hooks: Box<dyn PhaseHooks + 'a>) -> Self {
        Self { ws, validator, hooks }
    }

    /// True when every phase strictly between `current` and `target` may be skipped
    pub fn can_skip_to(&self, current: Phase, target: Phase) -> bool {
        target > current
            && current
                .between(target)
                .iter()
                .all(|p| self.ws.config.gates.for_phase(*p).skippable)
    }

    /// Advance one phase; from P7, complete the session
    pub fn next(&self, session_id: &str, opts: &TransitionOptions) -> PxResult<TransitionOutcome> {
        debug!(%session_id, ?opts, "PhaseEngine::next: called");
        let session = self.ws.require_session(session_id)?;
        if session.is_complete() {
            return Err(PxError::Validation(format!(
                "session '{}' already completed {}",
                session_id,
                Phase::P7
            )));
        }
        match session.current_phase.next() {
            Some(target) => self.transition(session_id, target, opts),
            None => self.complete(session, opts),
        }
    }

    /// Move a session to `target`
    ///
    /// Forward moves require the current phase's gates; jumps require every
    /// skipped phase to be skippable; backward moves require `force`. A
    /// refusal leaves every record untouched.
    pub fn transition(&self, session_id: &str, target: Phase, opts: &TransitionOptions) -> PxResult<TransitionOutcome> {
        debug!(%session_id, %target, ?opts, "PhaseEngine::transition: called");
        let mut session = self.ws.require_session(session_id)?;
        let from = session.current_phase;
        if target == from {
            return Err(PxError::Validation(format!("session '{}' is already at {}", session_id, from)));
        }

        let skipped = if target > from { from.between(target) } else { Vec::new() };
        let mut bypassed = Vec::new();
        let mut validation = None;
        let mut forced_skip = false;

        let kind = if target < from {
            if !opts.force {
                return Err(PxError::Validation(format!(
                    "moving back from {} to {} requires --force",
                    from, target
                )));
            }
            TransitionKind::Override
        } else {
            let mut kind = if skipped.is_empty() {
                TransitionKind::Advance
            } else {
                TransitionKind::Skip
            };
            if !skipped.is_empty() && !self.can_skip_to(from, target) {
                if !opts.force {
                    let blocked: Vec<String> = skipped
                        .iter()
                        .filter(|p| !self.ws.config.gates.for_phase(**p).skippable)
                        .map(Phase::to_string)
                        .collect();
                    return Err(PxError::Validation(format!(
                        "cannot skip to {}: {} not skippable",
                        target,
                        blocked.join(", ")
                    )));
                }
                forced_skip = true;
                kind = TransitionKind::Override;
            }

            let v = self.check_gates(&session, from)?;
            if !v.passed {
                if !opts.force {
                    return Err(PxError::GateFailure {
                        phase: from,
                        unmet: v.unmet(),
                    });
                }
                bypassed = v.unmet();
                kind = TransitionKind::Override;
            }
            validation = Some(v);
            kind
        };

        if kind == TransitionKind::Override && opts.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
            return Err(PxError::Validation("--force overrides require --reason".to_string()));
        }

        let outcome = TransitionOutcome {
            session_id: session_id.to_string(),
            from,
            to: target,
            kind,
            applied: !opts.dry_run,
            skipped,
            validation,
            bypassed,
            completed: false,
        };
        if opts.dry_run {
            info!(%session_id, %from, %target, %kind, "Dry run: transition allowed");
            return Ok(outcome);
        }

        self.apply(&mut session, &outcome, opts)?;

        if kind == TransitionKind::Skip {
            self.ws.audit(
                &opts.actor,
                "phase-skip",
                session_id,
                json!({ "from": from, "to": target, "skipped": outcome.skipped, "reason": opts.reason }),
            )?;
        }
        if kind == TransitionKind::Override && (target < from || forced_skip) {
            self.ws.audit(
                &opts.actor,
                "phase-override",
                session_id,
                json!({ "from": from, "to": target, "skipped": outcome.skipped, "reason": opts.reason }),
            )?;
        }
        if !outcome.bypassed.is_empty() {
            let unmet: Vec<String> = outcome.bypassed.iter().map(UnmetGate::to_string).collect();
            self.ws.audit(
                &opts.actor,
                "gate-bypass",
                session_id,
                json!({ "phase": from, "to": target, "unmet": unmet, "reason": opts.reason }),
            )?;
        }

        self.fire_hooks(&session, from, Some(target));
        Ok(outcome)
    }

    fn complete(&self, mut session: Session, opts: &TransitionOptions) -> PxResult<TransitionOutcome> {
        let from = session.current_phase;
        let v = self.check_gates(&session, from)?;
        let mut bypassed = Vec::new();
        let mut kind = TransitionKind::Complete;
        if !v.passed {
            if !opts.force {
                return Err(PxError::GateFailure {
                    phase: from,
                    unmet: v.unmet(),
                });
            }
            if opts.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
                return Err(PxError::Validation("--force overrides require --reason".to_string()));
            }
            bypassed = v.unmet();
            kind = TransitionKind::Override;
        }

        let outcome = TransitionOutcome {
            session_id: session.session_id.clone(),
            from,
            to: from,
            kind,
            applied: !opts.dry_run,
            skipped: Vec::new(),
            validation: Some(v),
            bypassed,
            completed: true,
        };
        if opts.dry_run {
            return Ok(outcome);
        }

        self.apply(&mut session, &outcome, opts)?;
        if !outcome.bypassed.is_empty() {
            let unmet: Vec<String> = outcome.bypassed.iter().map(UnmetGate::to_string).collect();
            self.ws.audit(
                &opts.actor,
                "gate-bypass",
                &session.session_id,
                json!({ "phase": from, "unmet": unmet, "reason": opts.reason }),
            )?;
        }
        info!(session = %session.session_id, "Session completed {}", from);
        self.fire_hooks(&session, from, None);
        Ok(outcome)
    }

    /// Persist a decided transition: gate record, session, then GlobalState totals
    fn apply(&self, session: &mut Session, outcome: &TransitionOutcome, opts: &TransitionOptions) -> PxResult<()> {
        let now = self.ws.now();
        if let Some(v) = &outcome.validation {
            if !v.branch.is_empty() {
                self.validator.record(v)?;
            }
            session.passed_gates.insert(outcome.from, v.passed_gates());
            session.metrics.gate_runs += 1;
            if !v.passed {
                session.metrics.gate_failures += 1;
            }
        }

        session.phase_history.push(PhaseChange {
            from: outcome.from,
            to: outcome.to,
            at: now,
            kind: outcome.kind,
            actor: opts.actor.clone(),
            reason: opts.reason.clone(),
        });
        session.current_phase = outcome.to;
        session.metrics.transitions += 1;
        if outcome.kind == TransitionKind::Override {
            session.metrics.forced_transitions += 1;
        }
        if outcome.completed {
            session.completed_at = Some(now);
        } else if outcome.to < outcome.from {
            session.completed_at = None;
        }
        session.last_active_at = now;
        if session.status == SessionStatus::Paused {
            session.status = SessionStatus::Active;
        }
        self.ws.store.save(&*session)?;

        self.ws.update_global(&opts.actor, |global| {
            global.totals.transitions += 1;
            Ok(())
        })?;
        self.ws.invalidate(&[CACHE_STATUS]);
        info!(
            session = %session.session_id,
            from = %outcome.from,
            to = %outcome.to,
            kind = %outcome.kind,
            "Phase transition applied"
        );
        Ok(())
    }

    /// Validate `phase` for the session's branch without recording
    fn check_gates(&self, session: &Session, phase: Phase) -> PxResult<PhaseValidation> {
        match &session.current_branch {
            Some(branch) => self.validator.evaluate(branch, phase),
            None if self.ws.config.gates.for_phase(phase).gates.is_empty() => Ok(PhaseValidation {
                branch: String::new(),
                phase,
                head: None,
                passed: true,
                results: Vec::new(),
            }),
            None => Err(PxError::Validation(format!(
                "session '{}' has no branch to validate {} gates against",
                session.session_id, phase
            ))),
        }
    }

    fn fire_hooks(&self, session: &Session, from: Phase, to: Option<Phase>) {
        let work_dir = session
            .current_branch
            .as_deref()
            .and_then(|name| BranchRegistry::new(self.ws).get(name).ok().flatten())
            .map(|branch| self.ws.work_dir(&branch))
            .unwrap_or_else(|| self.ws.repo_root.clone());
        let ctx = HookContext {
            session_id: session.session_id.clone(),
            branch: session.current_branch.clone(),
            from,
            to: to.unwrap_or(from),
            work_dir,
        };
        if let Err(e) = self.hooks.on_exit(from, &ctx) {
            warn!(session = %session.session_id, phase = %from, error = %e, "on-exit hook failed");
        }
        if let Some(to) = to
            && let Err(e) = self.hooks.on_enter(to, &ctx)
        {
            warn!(session = %session.session_id, phase = %to, error = %e, "on-enter hook failed");
        }
    }
}
