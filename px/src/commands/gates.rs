use colored::Colorize;
use tracing::debug;

use super::{session_branch, touch_session};
use crate::context::{CACHE_STATUS, Workspace};
use crate::domain::{Phase, TransitionKind};
use crate::error::{PxError, PxResult};
use crate::gates::{GateValidator, PhaseValidation};
use crate::phase::{PhaseEngine, TransitionOptions, TransitionOutcome};

/// Run and record the gates of `phase` (default: current) for the session's branch
pub fn validate_session(ws: &Workspace, session_id: &str, phase: Option<Phase>) -> PxResult<PhaseValidation> {
    debug!(%session_id, ?phase, "validate_session: called");
    let (mut session, branch) = session_branch(ws, session_id)?;
    let phase = phase.unwrap_or(session.current_phase);
    let validation = GateValidator::new(ws).validate_phase(&branch, phase)?;

    session.metrics.gate_runs += 1;
    if !validation.passed {
        session.metrics.gate_failures += 1;
    }
    session.touch(ws.now());
    ws.store.save(&session)?;
    ws.invalidate(&[CACHE_STATUS]);
    Ok(validation)
}

fn print_validation(validation: &PhaseValidation) {
    println!(
        "{} gates for {} at {}",
        validation.phase,
        validation.branch.cyan(),
        validation.head.as_deref().map(|h| &h[..h.len().min(10)]).unwrap_or("?")
    );
    if validation.results.is_empty() {
        println!("  (no gates configured)");
    }
    for r in &validation.results {
        let mark = if r.passed { "pass".green() } else { "FAIL".red().bold() };
        let reused = if r.reused { " (reused)" } else { "" };
        println!("  {:<4} {:<12} {}{}", mark, r.gate, r.detail, reused.dimmed());
    }
}

pub fn cmd_validate(ws: &Workspace, session_id: &str, phase: Option<Phase>) -> PxResult<()> {
    let validation = validate_session(ws, session_id, phase)?;
    print_validation(&validation);
    if !validation.passed {
        return Err(PxError::GateFailure {
            phase: validation.phase,
            unmet: validation.unmet(),
        });
    }
    println!("{}", "All gates passed".green().bold());
    Ok(())
}

pub fn cmd_next(
    ws: &Workspace,
    session_id: &str,
    dry_run: bool,
    force: bool,
    to: Option<Phase>,
    reason: Option<String>,
) -> PxResult<()> {
    let opts = TransitionOptions {
        force,
        dry_run,
        actor: session_id.to_string(),
        reason,
    };
    let engine = PhaseEngine::new(ws);
    let outcome = match to {
        Some(target) => engine.transition(session_id, target, &opts)?,
        None => engine.next(session_id, &opts)?,
    };
    if !dry_run {
        touch_session(ws, session_id);
    }
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &TransitionOutcome) {
    if let Some(validation) = &outcome.validation
        && !validation.results.is_empty()
    {
        print_validation(validation);
    }
    let prefix = if outcome.applied { "" } else { "[dry-run] would " };
    if outcome.completed {
        println!("{}{} {} for {}", prefix, "complete".green().bold(), outcome.from, outcome.session_id);
    } else {
        let verb = match outcome.kind {
            TransitionKind::Advance => "advance".green(),
            TransitionKind::Skip => "skip".yellow(),
            TransitionKind::Override => "override".red().bold(),
            TransitionKind::Complete => "complete".green(),
        };
        println!(
            "{}{} {} -> {} ({})",
            prefix,
            verb,
            outcome.from,
            outcome.to,
            outcome.to.title()
        );
    }
    if !outcome.skipped.is_empty() {
        let skipped: Vec<String> = outcome.skipped.iter().map(Phase::to_string).collect();
        println!("  skipped: {}", skipped.join(", "));
    }
    for unmet in &outcome.bypassed {
        println!("  {} {}", "bypassed".red(), unmet);
    }
}
