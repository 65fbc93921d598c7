use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::Workspace;
use crate::domain::{Branch, Phase, Session, validate_session_id};
use crate::error::{PxError, PxResult};
use crate::registry::{BranchRegistry, CreateBranch};

/// Names regenerated after losing a registration race
pub const MAX_NAME_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub session_id: String,
    pub phase: Phase,
    pub branch: Branch,
    /// The session existed before this command
    pub resumed: bool,
}

/// Create or resume `session_id` and register a fresh branch for it
pub fn start_session(
    ws: &Workspace,
    session_id: &str,
    description: &str,
    phase: Option<Phase>,
    base: Option<String>,
) -> PxResult<StartReport> {
    debug!(%session_id, %description, ?phase, ?base, "start_session: called");
    validate_session_id(session_id).map_err(PxError::Validation)?;

    let existing = ws.load_session(session_id)?;
    let resumed = existing.is_some();
    let mut session = match existing {
        Some(session) => {
            if let Some(requested) = phase
                && requested != session.current_phase
            {
                return Err(PxError::Validation(format!(
                    "session '{}' is at {}; use `px next --to {}` to move it",
                    session_id, session.current_phase, requested
                )));
            }
            session
        }
        None => Session::new(session_id, phase.unwrap_or_default(), ws.now()),
    };
    if session.is_complete() {
        return Err(PxError::Validation(format!(
            "session '{}' completed {}; close it with `px close`",
            session_id,
            Phase::P7
        )));
    }

    let registry = BranchRegistry::new(ws);
    let mut last_collision = None;
    let mut created = None;
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let name = registry.generate_name(session.current_phase, session_id, description)?;
        let req = CreateBranch {
            name,
            session_id: session_id.to_string(),
            phase: session.current_phase,
            description: description.to_string(),
            base: base.clone(),
        };
        match registry.create(&req) {
            Ok(branch) => {
                created = Some(branch);
                break;
            }
            Err(PxError::NameCollision(name)) => {
                warn!(%name, attempt, "Lost branch name race, regenerating");
                last_collision = Some(name);
            }
            Err(e) => return Err(e),
        }
    }
    let Some(branch) = created else {
        return Err(PxError::NameCollision(last_collision.unwrap_or_default()));
    };

    session.current_branch = Some(branch.name.clone());
    if resumed {
        session.touch(ws.now());
    }
    ws.store.save(&session)?;
    info!(%session_id, branch = %branch.name, resumed, "Session started");

    Ok(StartReport {
        session_id: session_id.to_string(),
        phase: session.current_phase,
        branch,
        resumed,
    })
}

pub fn cmd_start(ws: &Workspace, session_id: &str, description: &str, phase: Option<Phase>, base: Option<String>) -> PxResult<()> {
    let report = start_session(ws, session_id, description, phase, base)?;
    let verb = if report.resumed { "Resumed" } else { "Started" };
    println!(
        "{} session {} at {} ({})",
        verb.green().bold(),
        report.session_id.bold(),
        report.phase,
        report.phase.title()
    );
    println!("  branch:   {}", report.branch.name.cyan());
    println!("  base:     {}", report.branch.base);
    if let Some(worktree) = &report.branch.worktree {
        println!("  worktree: {}", worktree);
    }
    Ok(())
}
