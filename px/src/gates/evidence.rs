//! Pass-markers and report freshness

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Phase;
use crate::git::dir_name_for;

/// A worker's claim that a phase's work is done, written as YAML or JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassMarker {
    pub phase: Phase,
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PassMarker {
    pub fn new(phase: Phase, score: f64, recorded_by: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            phase,
            score,
            recorded_at,
            recorded_by: recorded_by.into(),
            notes: None,
        }
    }

    /// Parse a marker; YAML is a superset of JSON so both forms load
    pub fn read(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        serde_yaml::from_str(&content).map_err(|e| format!("malformed pass-marker {}: {}", path.display(), e))
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self).map_err(std::io::Error::other)?;
        fs::write(path, yaml)
    }
}

/// Evidence directory for one branch
pub fn branch_dir(evidence_root: &Path, branch: &str) -> PathBuf {
    evidence_root.join(dir_name_for(branch))
}

/// `<dir>/P<n>.pass`
pub fn marker_path(branch_dir: &Path, phase: Phase) -> PathBuf {
    branch_dir.join(format!("{}.pass", phase))
}

/// `<dir>/P<n>.pass.sig`
pub fn signature_path(branch_dir: &Path, phase: Phase) -> PathBuf {
    branch_dir.join(format!("{}.pass.sig", phase))
}

/// `<dir>/P<n>.approvals`
pub fn approvals_dir(branch_dir: &Path, phase: Phase) -> PathBuf {
    branch_dir.join(format!("{}.approvals", phase))
}

/// Fail when a report file is missing or older than `max_age`
pub fn check_fresh(path: &Path, now: DateTime<Utc>, max_age: chrono::Duration) -> Result<(), String> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|_| format!("missing report {}", path.display()))?;
    let modified: DateTime<Utc> = modified.into();
    if now - modified > max_age {
        return Err(format!(
            "stale report {} (written {})",
            path.display(),
            modified.format("%Y-%m-%d %H:%M")
        ));
    }
    Ok(())
}
