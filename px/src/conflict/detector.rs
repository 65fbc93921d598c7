//! Overlap detection between diverging branches

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sessionstore::Cache;
use tracing::{debug, info};

use super::classify::{Severity, classify};
use crate::context::{CACHE_CONFLICTS, CACHE_REPO};
use crate::error::PxResult;
use crate::git::GitRunner;

/// One path both sides touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    pub severity: Severity,
}

/// Overlap between two branches since they diverged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub branch_a: String,
    pub branch_b: String,
    #[serde(default)]
    pub merge_base: Option<String>,
    pub conflicting_files: Vec<FileConflict>,
    /// Worst severity over all files
    pub severity: Severity,
}

impl ConflictReport {
    /// True when the branches touched no common path
    pub fn is_clean(&self) -> bool {
        self.conflicting_files.is_empty()
    }

    pub fn is_manual(&self) -> bool {
        self.severity == Severity::Manual
    }

    pub fn paths(&self) -> Vec<&str> {
        self.conflicting_files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Conflicts of one branch against the integration branch and its siblings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConflicts {
    pub integration: Option<ConflictReport>,
    pub siblings: Vec<ConflictReport>,
}

impl BranchConflicts {
    /// True when the integration branch overlap needs a human
    pub fn blocks_merge(&self) -> bool {
        self.integration.as_ref().is_some_and(ConflictReport::is_manual)
    }

    pub fn all(&self) -> impl Iterator<Item = &ConflictReport> {
        self.integration.iter().chain(self.siblings.iter())
    }
}

/// Synchronous, on-demand conflict detector
///
/// Never writes to the repository: content comes from `git show` at the
/// merge-base and both heads, and the simulation runs in memory.
pub struct ConflictDetector<'a> {
    git: &'a GitRunner,
    cache: &'a Cache,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(git: &'a GitRunner, cache: &'a Cache) -> Self {
        Self { git, cache }
    }

    /// Compare two branches; `bypass` skips cached results
    pub fn check_pair(&self, branch_a: &str, branch_b: &str, bypass: bool) -> PxResult<ConflictReport> {
        debug!(%branch_a, %branch_b, bypass, "ConflictDetector::check_pair: called");
        let head_a = self.git.rev_parse(branch_a)?;
        let head_b = self.git.rev_parse(branch_b)?;
        let key = format!("{}@{}:{}@{}", branch_a, head_a, branch_b, head_b);

        self.cache.get_or_insert_with(CACHE_CONFLICTS, &key, bypass, || {
            self.compute(branch_a, &head_a, branch_b, &head_b)
        })
    }

    fn compute(&self, branch_a: &str, head_a: &str, branch_b: &str, head_b: &str) -> PxResult<ConflictReport> {
        let merge_base = self.merge_base(head_a, head_b)?;
        let Some(base) = merge_base.clone() else {
            debug!(%branch_a, %branch_b, "ConflictDetector::compute: unrelated histories");
            return Ok(ConflictReport {
                branch_a: branch_a.to_string(),
                branch_b: branch_b.to_string(),
                merge_base,
                conflicting_files: Vec::new(),
                severity: Severity::None,
            });
        };

        let touched_a: BTreeSet<String> = self.git.changed_files(&base, head_a)?.into_iter().collect();
        let touched_b: BTreeSet<String> = self.git.changed_files(&base, head_b)?.into_iter().collect();

        let mut conflicting_files = Vec::new();
        for path in touched_a.intersection(&touched_b) {
            let base_content = self.git.show_file(&base, path)?;
            let ours = self.git.show_file(head_a, path)?;
            let theirs = self.git.show_file(head_b, path)?;
            let severity = classify(base_content.as_deref(), ours.as_deref(), theirs.as_deref());
            conflicting_files.push(FileConflict {
                path: path.clone(),
                severity,
            });
        }
        let severity = conflicting_files.iter().map(|f| f.severity).max().unwrap_or_default();

        if !conflicting_files.is_empty() {
            info!(%branch_a, %branch_b, files = conflicting_files.len(), %severity, "Branches overlap");
        }
        Ok(ConflictReport {
            branch_a: branch_a.to_string(),
            branch_b: branch_b.to_string(),
            merge_base,
            conflicting_files,
            severity,
        })
    }

    /// Merge-base cached by the pair of head SHAs, which fully determine it
    fn merge_base(&self, head_a: &str, head_b: &str) -> PxResult<Option<String>> {
        let (lo, hi) = if head_a <= head_b { (head_a, head_b) } else { (head_b, head_a) };
        let key = format!("merge-base:{}:{}", lo, hi);
        self.cache
            .get_or_insert_with(CACHE_REPO, &key, false, || Ok(self.git.merge_base(lo, hi)?))
    }

    /// Check `branch` against the integration branch and every sibling
    ///
    /// Only overlapping reports are returned for siblings; the integration
    /// report is kept whenever it is not clean.
    pub fn check_branch(
        &self,
        branch: &str,
        siblings: &[String],
        integration: &str,
        bypass: bool,
    ) -> PxResult<BranchConflicts> {
        debug!(%branch, ?siblings, %integration, "ConflictDetector::check_branch: called");
        let integration = Some(self.check_pair(branch, integration, bypass)?).filter(|r| !r.is_clean());

        let mut reports = Vec::new();
        for other in siblings.iter().filter(|s| s.as_str() != branch) {
            let report = self.check_pair(branch, other, bypass)?;
            if !report.is_clean() {
                reports.push(report);
            }
        }
        Ok(BranchConflicts {
            integration,
            siblings: reports,
        })
    }

    /// Every overlapping pair among `branches`
    pub fn check_all(&self, branches: &[String], bypass: bool) -> PxResult<Vec<ConflictReport>> {
        debug!(count = branches.len(), "ConflictDetector::check_all: called");
        let mut reports = Vec::new();
        for (i, a) in branches.iter().enumerate() {
            for b in &branches[i + 1..] {
                let report = self.check_pair(a, b, bypass)?;
                if !report.is_clean() {
                    reports.push(report);
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit_file, delete_file, setup_git_repo};
    use sessionstore::system_clock;
    use std::path::Path;
    use tempfile::tempdir;

    const BASE: &str = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\n";

    fn repo_with_two_branches(dir: &Path) -> GitRunner {
        setup_git_repo(dir);
        commit_file(dir, "main", "shared.txt", BASE, "base");
        let git = GitRunner::new(dir);
        git.create_branch("feature/a1", "main").unwrap();
        git.create_branch("feature/b1", "main").unwrap();
        git
    }

    #[test]
    fn test_disjoint_files_have_no_conflicts() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "a.txt", "a\n", "a");
        commit_file(repo.path(), "feature/b1", "b.txt", "b\n", "b");
        let cache = Cache::new(state.path(), system_clock()).unwrap();

        let report = ConflictDetector::new(&git, &cache)
            .check_pair("feature/a1", "feature/b1", false)
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.severity, Severity::None);
    }

    #[test]
    fn test_same_file_disjoint_ranges_auto_resolvable() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "shared.txt", &BASE.replace("two", "TWO"), "a");
        commit_file(repo.path(), "feature/b1", "shared.txt", &BASE.replace("seven", "SEVEN"), "b");
        let cache = Cache::new(state.path(), system_clock()).unwrap();

        let report = ConflictDetector::new(&git, &cache)
            .check_pair("feature/a1", "feature/b1", false)
            .unwrap();
        assert_eq!(report.paths(), vec!["shared.txt"]);
        assert_eq!(report.severity, Severity::AutoResolvable);
    }

    #[test]
    fn test_overlapping_ranges_manual() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "shared.txt", &BASE.replace("four", "FOUR"), "a");
        commit_file(repo.path(), "feature/b1", "shared.txt", &BASE.replace("four", "4"), "b");
        let cache = Cache::new(state.path(), system_clock()).unwrap();

        let report = ConflictDetector::new(&git, &cache)
            .check_pair("feature/a1", "feature/b1", false)
            .unwrap();
        assert!(report.is_manual());
    }

    #[test]
    fn test_modify_delete_manual() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "shared.txt", &BASE.replace("two", "TWO"), "a");
        delete_file(repo.path(), "feature/b1", "shared.txt", "b");
        let cache = Cache::new(state.path(), system_clock()).unwrap();

        let report = ConflictDetector::new(&git, &cache)
            .check_pair("feature/a1", "feature/b1", false)
            .unwrap();
        assert_eq!(report.severity, Severity::Manual);
    }

    #[test]
    fn test_check_branch_against_integration_and_siblings() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "shared.txt", &BASE.replace("four", "FOUR"), "a");
        commit_file(repo.path(), "feature/b1", "shared.txt", &BASE.replace("four", "4"), "b");
        commit_file(repo.path(), "main", "other.txt", "x\n", "main moves on");
        let cache = Cache::new(state.path(), system_clock()).unwrap();
        let detector = ConflictDetector::new(&git, &cache);

        let siblings = vec!["feature/a1".to_string(), "feature/b1".to_string()];
        let result = detector.check_branch("feature/a1", &siblings, "main", false).unwrap();
        assert!(result.integration.is_none());
        assert!(!result.blocks_merge());
        assert_eq!(result.siblings.len(), 1);
        assert_eq!(result.siblings[0].branch_b, "feature/b1");

        commit_file(repo.path(), "main", "shared.txt", &BASE.replace("four", "IV"), "main edits");
        let result = detector.check_branch("feature/a1", &siblings, "main", false).unwrap();
        assert!(result.blocks_merge());
        assert_eq!(detector.check_all(&siblings, false).unwrap().len(), 1);
    }

    #[test]
    fn test_reports_are_cached_by_head() {
        let repo = tempdir().unwrap();
        let state = tempdir().unwrap();
        let git = repo_with_two_branches(repo.path());
        commit_file(repo.path(), "feature/a1", "a.txt", "a\n", "a");
        let cache = Cache::new(state.path(), system_clock()).unwrap();
        let detector = ConflictDetector::new(&git, &cache);

        detector.check_pair("feature/a1", "feature/b1", false).unwrap();
        let before = cache.stats();
        detector.check_pair("feature/a1", "feature/b1", false).unwrap();
        assert_eq!(cache.stats().hits, before.hits + 1);

        detector.check_pair("feature/a1", "feature/b1", true).unwrap();
        assert_eq!(cache.stats().bypasses, before.bypasses + 1);
    }
}
