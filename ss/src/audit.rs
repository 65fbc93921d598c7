//! Append-only audit trail
//!
//! One JSON object per line. Every entry is written with a single `write`
//! on a file opened with `O_APPEND`, so concurrent writers never interleave
//! partial lines.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult, io_at};

/// A single audited action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub at: DateTime<Utc>,
    /// Session or component that performed the action
    pub actor: String,
    /// Kebab-case action name, e.g. `phase-override`
    pub action: String,
    /// What the action applied to (branch, session, lock name)
    pub subject: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(at: DateTime<Utc>, actor: impl Into<String>, action: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            at,
            actor: actor.into(),
            action: action.into(),
            subject: subject.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Handle to the audit log file
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry
    pub fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        debug!(action = %entry.action, subject = %entry.subject, "AuditLog::append: called");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }

        let mut line = serde_json::to_vec(entry).map_err(|source| StoreError::Encode {
            what: "audit entry".to_string(),
            source,
        })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_at(&self.path))?;
        file.write_all(&line).map_err(io_at(&self.path))?;
        file.sync_data().map_err(io_at(&self.path))?;
        Ok(())
    }

    /// Read every well-formed entry; malformed lines are skipped
    pub fn read_all(&self) -> StoreResult<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(io_at(&self.path))?;
        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_at(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = lineno + 1, error = %e, "AuditLog::read_all: skipping malformed line"),
            }
        }
        Ok(entries)
    }

    /// Entries with the given action name
    pub fn by_action(&self, action: &str) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.read_all()?.into_iter().filter(|e| e.action == action).collect())
    }
}
