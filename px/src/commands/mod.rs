//! Command implementations behind the `px` subcommands
//!
//! Each command has a core function returning a structured report, used by
//! tests and by other commands, and a `cmd_*` wrapper that prints it.

mod gates;
mod maintenance;
mod merge;
mod publish;
mod start;
mod status;

pub use gates::{cmd_next, cmd_validate, validate_session};
pub use maintenance::{cmd_backup, cmd_clean, cmd_close, cmd_restore, close_session, restore_state};
pub use merge::{MergeOptions, MergeReport, cmd_merge, merge_branch};
pub use publish::{PublishReport, cmd_publish, publish_branch};
pub use start::{MAX_NAME_ATTEMPTS, StartReport, cmd_start, start_session};
pub use status::{BranchRow, SessionRow, StatusReport, cmd_status, collect_status};

use tracing::warn;

use crate::conflict::ConflictReport;
use crate::context::Workspace;
use crate::domain::{RecordedConflict, Session};
use crate::error::{PxError, PxResult};

/// Record activity for the owning session; a missing session is not an error
pub(crate) fn touch_session(ws: &Workspace, session_id: &str) {
    let result: PxResult<()> = (|| {
        if let Some(mut session) = ws.load_session(session_id)? {
            session.touch(ws.now());
            ws.store.save(&session)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!(%session_id, error = %e, "Could not record session activity");
    }
}

/// The session and the branch it is working on
pub(crate) fn session_branch(ws: &Workspace, session_id: &str) -> PxResult<(Session, String)> {
    let session = ws.require_session(session_id)?;
    let branch = session
        .current_branch
        .clone()
        .ok_or_else(|| PxError::Validation(format!("session '{}' has no branch; run `px start` first", session_id)))?;
    Ok((session, branch))
}

/// Flatten reports into the form kept on the branch record
pub(crate) fn recorded(branch: &str, reports: &[&ConflictReport], ws: &Workspace) -> Vec<RecordedConflict> {
    reports
        .iter()
        .map(|r| RecordedConflict {
            other: if r.branch_a == branch { r.branch_b.clone() } else { r.branch_a.clone() },
            severity: r.severity.to_string(),
            files: r.paths().into_iter().map(String::from).collect(),
            detected_at: ws.now(),
        })
        .collect()
}
