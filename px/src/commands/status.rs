use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use sessionstore::{CacheStats, LockInfo};
use tracing::{debug, warn};

use super::recorded;
use crate::cli::OutputFormat;
use crate::conflict::{ConflictDetector, ConflictReport, Severity};
use crate::context::Workspace;
use crate::domain::{Branch, Phase, Session, SessionStatus};
use crate::error::PxResult;
use crate::registry::BranchRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub session_id: String,
    /// Derived: an idle active session shows as paused
    pub status: SessionStatus,
    pub phase: Phase,
    pub branch: Option<String>,
    pub idle_mins: i64,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchRow {
    pub name: String,
    pub session_id: String,
    /// The owning session's phase while it works on this branch
    pub phase: Phase,
    pub published: bool,
    pub worktree: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub terminal: String,
    pub integration_branch: String,
    pub sessions: Vec<SessionRow>,
    pub branches: Vec<BranchRow>,
    pub conflicts: Vec<ConflictReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<Vec<LockInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

fn branch_phase(branch: &Branch, sessions: &[Session]) -> Phase {
    sessions
        .iter()
        .find(|s| s.session_id == branch.session_id && s.current_branch.as_deref() == Some(branch.name.as_str()))
        .map(|s| s.current_phase)
        .unwrap_or(branch.phase_at_creation)
}

/// Gather everything `status` shows; conflict detection never fails the command
pub fn collect_status(ws: &Workspace, terminal: &str, verbose: bool) -> PxResult<StatusReport> {
    debug!(%terminal, verbose, "collect_status: called");
    let now = ws.now();
    let pause_after = chrono::Duration::minutes(i64::try_from(ws.config.sessions.pause_after_mins).unwrap_or(i64::MAX / 60_000));
    let sessions = ws.store.list::<Session>()?;
    let branches = BranchRegistry::new(ws).list_active()?;

    let session_rows = sessions
        .iter()
        .map(|s| SessionRow {
            session_id: s.session_id.clone(),
            status: s.effective_status(now, pause_after),
            phase: s.current_phase,
            branch: s.current_branch.clone(),
            idle_mins: s.idle_for(now).num_minutes(),
            completed: s.is_complete(),
        })
        .collect();
    let branch_rows = branches
        .iter()
        .map(|b| BranchRow {
            name: b.name.clone(),
            session_id: b.session_id.clone(),
            phase: branch_phase(b, &sessions),
            published: b.published.is_some(),
            worktree: b.worktree.clone(),
        })
        .collect();

    let conflicts = detect_conflicts(ws, terminal, &branches);

    let (locks, claims, cache) = if verbose {
        let global = ws.load_global()?;
        (
            Some(ws.locks.list()?),
            Some(global.resource_locks),
            Some(ws.cache.stats()),
        )
    } else {
        (None, None, None)
    };

    Ok(StatusReport {
        generated_at: now,
        terminal: terminal.to_string(),
        integration_branch: ws.config.integration_branch.clone(),
        sessions: session_rows,
        branches: branch_rows,
        conflicts,
        locks,
        claims,
        cache,
    })
}

fn detect_conflicts(ws: &Workspace, terminal: &str, branches: &[Branch]) -> Vec<ConflictReport> {
    let detector = ConflictDetector::new(&ws.git, &ws.cache);
    let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();
    let integration = &ws.config.integration_branch;

    let mut reports = match detector.check_all(&names, false) {
        Ok(reports) => reports,
        Err(e) => {
            warn!(error = %e, "Conflict detection between branches failed");
            Vec::new()
        }
    };
    for name in &names {
        match detector.check_pair(name, integration, false) {
            Ok(report) if !report.is_clean() => reports.push(report),
            Ok(_) => {}
            Err(e) => warn!(branch = %name, error = %e, "Conflict detection against integration failed"),
        }
    }

    for branch in branches.iter().filter(|b| b.session_id == terminal) {
        let own: Vec<&ConflictReport> = reports
            .iter()
            .filter(|r| r.branch_a == branch.name || r.branch_b == branch.name)
            .collect();
        if let Err(e) = BranchRegistry::new(ws).record_conflicts(&branch.name, recorded(&branch.name, &own, ws)) {
            warn!(branch = %branch.name, error = %e, "Could not record detected conflicts");
        }
    }
    reports
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::None => severity.to_string().normal(),
        Severity::AutoResolvable => severity.to_string().yellow(),
        Severity::Manual => severity.to_string().red().bold(),
    }
}

fn status_label(status: SessionStatus) -> colored::ColoredString {
    match status {
        SessionStatus::Active => status.to_string().green(),
        SessionStatus::Paused => status.to_string().yellow(),
        SessionStatus::Closed => status.to_string().dimmed(),
    }
}

pub fn cmd_status(ws: &Workspace, terminal: &str, verbose: bool, format: OutputFormat) -> PxResult<()> {
    let report = collect_status(ws, terminal, verbose)?;
    super::touch_session(ws, terminal);

    if format == OutputFormat::Json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| crate::error::PxError::Validation(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    println!("{}", "Sessions".bold());
    if report.sessions.is_empty() {
        println!("  (none)");
    }
    for s in &report.sessions {
        let marker = if s.session_id == report.terminal { "*" } else { " " };
        let done = if s.completed { " (complete)" } else { "" };
        println!(
            "{} {:<10} {:<8} {}{} {:<40} idle {}m",
            marker,
            s.session_id,
            status_label(s.status),
            s.phase,
            done,
            s.branch.as_deref().unwrap_or("-"),
            s.idle_mins
        );
    }

    println!("\n{}", "Active branches".bold());
    if report.branches.is_empty() {
        println!("  (none)");
    }
    for b in &report.branches {
        let published = if b.published { " published" } else { "" };
        println!("  {:<48} {:<8} {}{}", b.name.cyan(), b.session_id, b.phase, published);
    }

    if !report.conflicts.is_empty() {
        println!("\n{}", "Overlaps".bold());
        for c in &report.conflicts {
            println!(
                "  {} <> {}  [{}]  {}",
                c.branch_a,
                c.branch_b,
                severity_label(c.severity),
                c.paths().join(", ")
            );
        }
    }

    if let Some(locks) = &report.locks {
        println!("\n{}", "Locks".bold());
        if locks.is_empty() {
            println!("  (none)");
        }
        for l in locks {
            println!(
                "  {:<20} {:<10} pid {} on {} until {}",
                l.name,
                l.owner,
                l.pid,
                l.host,
                l.expires_at.format("%H:%M:%S")
            );
        }
    }
    if let Some(claims) = &report.claims {
        println!("\n{}", "Resource claims".bold());
        for (resource, holder) in claims {
            println!("  {:<56} {}", resource, holder);
        }
    }
    if let Some(stats) = &report.cache {
        println!("\n{}", "Cache (this process)".bold());
        println!(
            "  hits {}  misses {}  bypasses {}  writes {}  invalidations {}  hit rate {:.0}%",
            stats.hits,
            stats.misses,
            stats.bypasses,
            stats.writes,
            stats.invalidations,
            stats.hit_rate() * 100.0
        );
    }
    Ok(())
}
