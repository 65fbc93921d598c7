//! GlobalState singleton
//!
//! The only shared mutable record. Every change happens while holding the
//! `global` lock: load, mutate, save, release.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionstore::Record;

use super::branch::BranchStatus;

/// Record id and lock name of the singleton
pub const GLOBAL_ID: &str = "global";

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub sessions_started: u64,
    pub branches_created: u64,
    pub merged: u64,
    pub abandoned: u64,
    pub transitions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub id: String,

    #[serde(default)]
    pub active_sessions: BTreeSet<String>,

    #[serde(default)]
    pub active_branches: BTreeSet<String>,

    /// Every branch name ever registered
    #[serde(default)]
    pub known_branches: BTreeSet<String>,

    /// Resource name to holding session, e.g. `branch:<name>` → `t1`
    #[serde(default)]
    pub resource_locks: BTreeMap<String, String>,

    #[serde(default)]
    pub totals: Totals,

    pub updated_at: DateTime<Utc>,
}

/// Resource key claimed for a branch
pub fn branch_claim(name: &str) -> String {
    format!("branch:{}", name)
}

impl GlobalState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: GLOBAL_ID.to_string(),
            active_sessions: BTreeSet::new(),
            active_branches: BTreeSet::new(),
            known_branches: BTreeSet::new(),
            resource_locks: BTreeMap::new(),
            totals: Totals::default(),
            updated_at: now,
        }
    }

    /// True when `name` was ever registered
    pub fn is_known(&self, name: &str) -> bool {
        self.known_branches.contains(name) || self.active_branches.contains(name)
    }

    pub fn register_session(&mut self, session_id: &str) -> bool {
        let added = self.active_sessions.insert(session_id.to_string());
        if added {
            self.totals.sessions_started += 1;
        }
        added
    }

    /// Drop a session and every resource it claimed
    pub fn remove_session(&mut self, session_id: &str) {
        self.active_sessions.remove(session_id);
        self.resource_locks.retain(|_, holder| holder != session_id);
    }

    pub fn register_branch(&mut self, name: &str, session_id: &str) {
        self.active_branches.insert(name.to_string());
        self.known_branches.insert(name.to_string());
        self.resource_locks.insert(branch_claim(name), session_id.to_string());
        self.totals.branches_created += 1;
    }

    pub fn retire_branch(&mut self, name: &str, outcome: BranchStatus) {
        if self.active_branches.remove(name) {
            match outcome {
                BranchStatus::Merged => self.totals.merged += 1,
                BranchStatus::Abandoned => self.totals.abandoned += 1,
                BranchStatus::Active => {}
            }
        }
        self.resource_locks.remove(&branch_claim(name));
    }

    pub fn claims_of(&self, session_id: &str) -> Vec<String> {
        self.resource_locks
            .iter()
            .filter(|(_, holder)| holder.as_str() == session_id)
            .map(|(resource, _)| resource.clone())
            .collect()
    }
}

impl Record for GlobalState {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_name() -> &'static str {
        ""
    }

    fn validate(&self) -> Result<(), String> {
        if self.id != GLOBAL_ID {
            return Err(format!("unexpected global id '{}'", self.id));
        }
        if let Some(name) = self.active_branches.iter().find(|b| !self.known_branches.contains(*b)) {
            return Err(format!("active branch '{}' missing from known branches", name));
        }
        Ok(())
    }
}
