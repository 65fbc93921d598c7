//! Worktree manager for creating, listing, and cleaning up per-branch git worktrees

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::runner::{GitError, GitOp, GitRunner};

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Worktree corrupted: {0}")]
    Corrupted(String),

    #[error("Disk space error: {0}")]
    DiskSpace(String),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Configuration for worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for worktrees
    pub base_dir: PathBuf,

    /// Path to the canonical repository
    pub repo_root: PathBuf,

    /// Minimum free space in MB before refusing to create worktrees
    pub min_disk_space_mb: u64,
}

/// Information about a worktree on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Directory name under the base directory
    pub dir_name: String,

    pub path: PathBuf,

    /// Branch name, recovered from the directory name
    pub branch: String,
}

/// Directory name used for a branch's worktree; `/` cannot appear in a
/// directory name and `+` cannot appear in a branch name
pub fn dir_name_for(branch: &str) -> String {
    branch.replace('/', "+")
}

fn branch_for(dir_name: &str) -> String {
    dir_name.replace('+', "/")
}

/// Manager for git worktrees
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    config: WorktreeConfig,
    git: GitRunner,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig, git: GitRunner) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        let git = git.at(&config.repo_root);
        Self { config, git }
    }

    /// Check out an existing branch into its own worktree
    pub fn create(&self, branch: &str) -> Result<WorktreeInfo, WorktreeError> {
        debug!(%branch, "WorktreeManager::create: called");

        if let Err(e) = fs::create_dir_all(&self.config.base_dir) {
            debug!("WorktreeManager::create: failed to create base dir");
            return Err(WorktreeError::CreateFailed(format!("Failed to create base dir: {}", e)));
        }
        self.ensure_disk_space()?;

        let dir_name = dir_name_for(branch);
        let worktree_path = self.config.base_dir.join(&dir_name);
        if worktree_path.exists() {
            return Err(WorktreeError::CreateFailed(format!(
                "{} already exists",
                worktree_path.display()
            )));
        }

        let path_arg = worktree_path.to_string_lossy().to_string();
        let out = self.git.run_unchecked(GitOp::Worktree, &["add", &path_arg, branch])?;
        if !out.success {
            debug!("WorktreeManager::create: git worktree add failed");
            return Err(WorktreeError::CreateFailed(out.stderr.trim().to_string()));
        }

        info!("Created worktree at {:?} on branch {}", worktree_path, branch);

        Ok(WorktreeInfo {
            dir_name,
            path: worktree_path,
            branch: branch.to_string(),
        })
    }

    /// Remove a branch's worktree; the branch itself is left alone
    pub fn remove(&self, branch: &str) -> Result<(), WorktreeError> {
        debug!(%branch, "WorktreeManager::remove: called");
        let worktree_path = self.worktree_path(branch);

        if !worktree_path.exists() {
            debug!("WorktreeManager::remove: worktree does not exist, skipping");
            let _ = self.git.run_unchecked(GitOp::Worktree, &["prune"]);
            return Ok(());
        }

        let path_arg = worktree_path.to_string_lossy().to_string();
        let out = self
            .git
            .run_unchecked(GitOp::Worktree, &["remove", "--force", &path_arg])?;
        if !out.success {
            if !out.stderr.contains("is not a working tree") {
                debug!("WorktreeManager::remove: git worktree remove failed");
                return Err(WorktreeError::RemoveFailed(out.stderr.trim().to_string()));
            }
            // Stray directory that git no longer tracks
            fs::remove_dir_all(&worktree_path).map_err(|e| WorktreeError::RemoveFailed(e.to_string()))?;
        }
        let _ = self.git.run_unchecked(GitOp::Worktree, &["prune"]);

        info!("Removed worktree for {}", branch);
        Ok(())
    }

    /// Validate a worktree is healthy
    pub fn validate(&self, branch: &str) -> Result<(), WorktreeError> {
        debug!(%branch, "WorktreeManager::validate: called");
        let worktree_path = self.worktree_path(branch);

        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(branch.to_string()));
        }

        let out = self.git.at(&worktree_path).run_unchecked(GitOp::Status, &["--porcelain"])?;
        if !out.success {
            debug!("WorktreeManager::validate: worktree corrupted");
            return Err(WorktreeError::Corrupted(branch.to_string()));
        }
        Ok(())
    }

    /// List all worktree directories under the base directory
    pub fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        debug!("WorktreeManager::list: called");
        let mut worktrees = Vec::new();

        if !self.config.base_dir.exists() {
            return Ok(worktrees);
        }

        let entries = fs::read_dir(&self.config.base_dir)
            .map_err(|e| WorktreeError::Corrupted(format!("Failed to read worktrees directory: {}", e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            worktrees.push(WorktreeInfo {
                branch: branch_for(&dir_name),
                dir_name,
                path,
            });
        }
        worktrees.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));

        debug!(count = worktrees.len(), "WorktreeManager::list: returning worktrees");
        Ok(worktrees)
    }

    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.config.base_dir.join(dir_name_for(branch))
    }

    pub fn exists(&self, branch: &str) -> bool {
        self.worktree_path(branch).exists()
    }

    fn ensure_disk_space(&self) -> Result<(), WorktreeError> {
        let available_mb = available_mb(&self.config.base_dir)?;
        if available_mb < self.config.min_disk_space_mb {
            return Err(WorktreeError::DiskSpace(format!(
                "Only {}MB available, need {}MB minimum",
                available_mb, self.config.min_disk_space_mb
            )));
        }
        debug!(available_mb, "WorktreeManager::ensure_disk_space: sufficient disk space");
        Ok(())
    }

    /// Remove worktrees whose branch is not in `active_branches`; returns their branches
    pub fn cleanup_orphaned(&self, active_branches: &[String], dry_run: bool) -> Result<Vec<String>, WorktreeError> {
        debug!(?active_branches, dry_run, "WorktreeManager::cleanup_orphaned: called");
        let mut cleaned = Vec::new();

        for wt in self.list()? {
            if active_branches.contains(&wt.branch) {
                continue;
            }
            if dry_run {
                cleaned.push(wt.branch);
                continue;
            }
            info!("Cleaning up orphaned worktree: {}", wt.dir_name);
            match self.remove(&wt.branch) {
                Ok(()) => cleaned.push(wt.branch),
                Err(e) => warn!("Failed to remove orphaned worktree {}: {}", wt.dir_name, e),
            }
        }
        Ok(cleaned)
    }
}

fn available_mb(dir: &Path) -> Result<u64, WorktreeError> {
    fs2::available_space(dir)
        .map(|bytes| bytes / (1024 * 1024))
        .map_err(|e| WorktreeError::DiskSpace(format!("Failed to check disk space: {}", e)))
}
