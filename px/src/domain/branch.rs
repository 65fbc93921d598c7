//! Branch domain type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionstore::Record;

use super::naming::validate_branch_name;
use super::phase::Phase;

/// Branch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    #[default]
    Active,
    Merged,
    Abandoned,
}

impl BranchStatus {
    pub fn is_retired(self) -> bool {
        self != BranchStatus::Active
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merged => write!(f, "merged"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Where and how a branch was pushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishInfo {
    pub remote: String,
    pub draft: bool,
    /// Branch a review request should target
    pub base: String,
    pub at: DateTime<Utc>,
}

/// Overlap with another branch recorded by the owning session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedConflict {
    pub other: String,
    pub severity: String,
    pub files: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Metadata for a branch created through the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub session_id: String,
    pub phase_at_creation: Phase,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub status: BranchStatus,

    /// Branches this one builds on
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub conflicts: Vec<RecordedConflict>,

    #[serde(default)]
    pub description: String,

    /// Integration branch it was forked from
    pub base: String,

    /// Absolute path of the branch's worktree, if any
    #[serde(default)]
    pub worktree: Option<String>,

    #[serde(default)]
    pub published: Option<PublishInfo>,

    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub merge_commit: Option<String>,
}

impl Branch {
    pub fn new(
        name: impl Into<String>,
        session_id: impl Into<String>,
        phase: Phase,
        base: impl Into<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            session_id: session_id.into(),
            phase_at_creation: phase,
            created_at: now,
            status: BranchStatus::Active,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            description: description.into(),
            base: base.into(),
            worktree: None,
            published: None,
            retired_at: None,
            merge_commit: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BranchStatus::Active
    }

    /// Mark merged or abandoned; the record is kept
    pub fn retire(&mut self, outcome: BranchStatus, now: DateTime<Utc>) {
        self.status = outcome;
        self.retired_at = Some(now);
    }
}

impl Record for Branch {
    fn id(&self) -> &str {
        &self.name
    }

    fn collection_name() -> &'static str {
        "branches"
    }

    fn validate(&self) -> Result<(), String> {
        validate_branch_name(&self.name)?;
        if self.session_id.is_empty() {
            return Err("branch has no owning session".to_string());
        }
        match (self.status.is_retired(), self.retired_at) {
            (true, None) => Err(format!("{} branch has no retired_at", self.status)),
            (false, Some(_)) => Err("active branch has retired_at set".to_string()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{assert_corrupt_on_disk, at, temp_store};
    use proptest::prelude::*;

    fn branch() -> Branch {
        Branch::new("feature/P3-t1-x1", "t1", Phase::P3, "main", "x1", Utc::now())
    }

    #[test]
    fn test_new_branch_is_valid() {
        let b = branch();
        assert!(b.is_active());
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_retire() {
        let mut b = branch();
        b.retire(BranchStatus::Merged, Utc::now());
        assert!(!b.is_active());
        assert!(b.retired_at.is_some());
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_inconsistent_status() {
        let mut b = branch();
        b.status = BranchStatus::Abandoned;
        assert!(b.validate().is_err());

        let mut b = branch();
        b.name = "feature/bad name".to_string();
        assert!(b.validate().is_err());
    }

    fn branch_strategy() -> impl Strategy<Value = Branch> {
        (
            "[a-z0-9]{2,12}",
            "t[0-9]",
            0u8..8,
            0i64..100_000,
            0u8..3,
            proptest::option::of("[0-9a-f]{40}"),
            "[a-z ]{0,20}",
        )
            .prop_map(|(leaf, session, phase, created, status, commit, description)| {
                let phase = Phase::from_index(phase).unwrap();
                let name = format!("feature/P{}-{}-{}", phase.index(), session, leaf);
                let mut branch = Branch::new(name, session, phase, "main", description, at(created));
                match status {
                    1 => {
                        branch.retire(BranchStatus::Merged, at(created + 60));
                        branch.merge_commit = commit;
                    }
                    2 => branch.retire(BranchStatus::Abandoned, at(created + 60)),
                    _ => {}
                }
                branch
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_branch_round_trips_through_store(branch in branch_strategy()) {
            let (_temp, store) = temp_store();
            let name = branch.name.clone();
            store.save(&branch).unwrap();
            prop_assert_eq!(store.load::<Branch>(&name).unwrap(), Some(branch));
        }

        #[test]
        fn prop_branch_with_inconsistent_retirement_is_corrupt(branch in branch_strategy()) {
            let mut broken = branch.clone();
            broken.retired_at = if branch.status.is_retired() { None } else { Some(at(0)) };
            prop_assert!(broken.validate().is_err());

            let (_temp, store) = temp_store();
            assert_corrupt_on_disk(&store, &broken, &branch);
        }
    }
}
