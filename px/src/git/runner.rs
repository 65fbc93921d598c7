//! Git command runner with hard timeouts and bounded retry

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(50);
const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_JITTER_MS: u64 = 100;

/// The closed set of git operations the adapter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOp {
    Add,
    Branch,
    Checkout,
    Commit,
    Diff,
    Fetch,
    Log,
    Merge,
    MergeBase,
    Pull,
    Push,
    Remote,
    Reset,
    RevParse,
    Show,
    Status,
    Verify,
    Worktree,
}

impl GitOp {
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Branch => "branch",
            Self::Checkout => "checkout",
            Self::Commit => "commit",
            Self::Diff => "diff",
            Self::Fetch => "fetch",
            Self::Log => "log",
            Self::Merge => "merge",
            Self::MergeBase => "merge-base",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Remote => "remote",
            Self::Reset => "reset",
            Self::RevParse => "rev-parse",
            Self::Show => "show",
            Self::Status => "status",
            Self::Verify => "verify-commit",
            Self::Worktree => "worktree",
        }
    }

    /// Network operations; the only ones ever retried
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Fetch | Self::Push | Self::Pull)
    }
}

impl std::fmt::Display for GitOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.subcommand())
    }
}

/// Captured result of one git invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl GitOutput {
    /// First line of stdout, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }

    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Error types for git operations
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Network error during git {op}: {message}")]
    Network { op: GitOp, message: String },

    #[error("Conflict during git {op}: {message}")]
    Conflict { op: GitOp, message: String },

    #[error("Authentication failed during git {op}: {message}")]
    Auth { op: GitOp, message: String },

    #[error("git {op} failed (exit {code:?}): {message}")]
    Unknown {
        op: GitOp,
        code: Option<i32>,
        message: String,
    },

    #[error("git {op} timed out after {after:?}")]
    Timeout { op: GitOp, after: Duration },

    #[error("Failed to run git {op}: {source}")]
    Spawn {
        op: GitOp,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    /// Network-class failures are the only retryable kind
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

/// Map a failed invocation to an error class by inspecting stderr
pub fn classify(op: GitOp, output: &GitOutput) -> GitError {
    let stderr = output.stderr.to_lowercase();
    let message = output.stderr.trim().to_string();
    let any = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));

    if any(&[
        "authentication failed",
        "permission denied",
        "could not read username",
        "invalid username or password",
        "returned error: 403",
        "returned error: 401",
    ]) {
        GitError::Auth { op, message }
    } else if any(&[
        "could not resolve host",
        "connection timed out",
        "connection refused",
        "network is unreachable",
        "operation timed out",
        "the remote end hung up",
        "early eof",
        "unable to access",
        "tls connection",
    ]) {
        GitError::Network { op, message }
    } else if any(&[
        "conflict",
        "would be overwritten",
        "non-fast-forward",
        "[rejected]",
        "not possible to fast-forward",
        "unmerged files",
    ]) {
        GitError::Conflict { op, message }
    } else {
        GitError::Unknown {
            op,
            code: output.exit_code,
            message,
        }
    }
}

/// Runs git in one directory with the configured limits
#[derive(Debug, Clone)]
pub struct GitRunner {
    dir: PathBuf,
    timeout: Duration,
    network_timeout: Duration,
    max_retries: u32,
}

impl GitRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(120),
            max_retries: 3,
        }
    }

    pub fn with_limits(mut self, timeout: Duration, network_timeout: Duration, max_retries: u32) -> Self {
        self.timeout = timeout;
        self.network_timeout = network_timeout;
        self.max_retries = max_retries;
        self
    }

    /// Same limits, different working directory
    pub fn at(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Locate the canonical repository root, even from inside a linked worktree
    pub fn discover(start: &Path) -> Result<PathBuf, GitError> {
        debug!(?start, "GitRunner::discover: called");
        let runner = GitRunner::new(start);
        let out = runner.run(GitOp::RevParse, &["--path-format=absolute", "--git-common-dir"])?;
        let common = PathBuf::from(out.first_line());
        if common.file_name().is_some_and(|n| n == ".git")
            && let Some(parent) = common.parent()
        {
            return Ok(parent.to_path_buf());
        }
        Ok(common)
    }

    fn timeout_for(&self, op: GitOp) -> Duration {
        if op.is_transient() { self.network_timeout } else { self.timeout }
    }

    /// Run and return the raw output whatever the exit status
    ///
    /// Only spawn failures and timeouts are errors.
    pub fn run_unchecked(&self, op: GitOp, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run_once(op, args, self.timeout_for(op))
    }

    /// Run with the default timeout and retry budget
    pub fn run(&self, op: GitOp, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run_with(op, args, self.timeout_for(op), self.max_retries)
    }

    /// Run, classifying failures; transient operations retry network-class errors
    pub fn run_with(&self, op: GitOp, args: &[&str], timeout: Duration, max_retries: u32) -> Result<GitOutput, GitError> {
        let attempts = if op.is_transient() { 1 + max_retries } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.run_once(op, args, timeout).and_then(|out| {
                if out.success { Ok(out) } else { Err(classify(op, &out)) }
            });
            match result {
                Err(e) if e.is_network() && attempt < attempts => {
                    let delay = backoff(attempt);
                    warn!(%op, attempt, ?delay, error = %e, "Retrying git operation");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    fn run_once(&self, op: GitOp, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        debug!(%op, ?args, dir = ?self.dir, "GitRunner::run_once: called");
        let spawn_err = |source| GitError::Spawn { op, source };

        let mut stdout = tempfile::tempfile().map_err(spawn_err)?;
        let mut stderr = tempfile::tempfile().map_err(spawn_err)?;

        let child = Command::new("git")
            .arg(op.subcommand())
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(stdout.try_clone().map_err(spawn_err)?)
            .stderr(stderr.try_clone().map_err(spawn_err)?)
            .spawn()
            .map_err(spawn_err)?;

        let status = match wait_with_timeout(child, timeout).map_err(spawn_err)? {
            Some(status) => status,
            None => {
                warn!(%op, ?timeout, "git timed out and was killed");
                return Err(GitError::Timeout { op, after: timeout });
            }
        };

        let output = GitOutput {
            success: status.success(),
            stdout: read_all(&mut stdout).map_err(spawn_err)?,
            stderr: read_all(&mut stderr).map_err(spawn_err)?,
            exit_code: status.code(),
        };
        if !output.success {
            debug!(%op, code = ?output.exit_code, stderr = %output.stderr.trim(), "GitRunner::run_once: non-zero exit");
        }
        Ok(output)
    }

    /// Full SHA of a revision
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let spec = format!("{}^{{commit}}", rev);
        Ok(self.run(GitOp::RevParse, &["--verify", &spec])?.first_line().to_string())
    }

    /// Best common ancestor; `None` when the histories are unrelated
    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        let out = self.run_unchecked(GitOp::MergeBase, &[a, b])?;
        match out.exit_code {
            Some(0) => Ok(Some(out.first_line().to_string())),
            Some(1) if out.stderr.trim().is_empty() => Ok(None),
            _ => Err(classify(GitOp::MergeBase, &out)),
        }
    }

    /// True when `ancestor` is reachable from `descendant`
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self.run_unchecked(GitOp::MergeBase, &["--is-ancestor", ancestor, descendant])?;
        match out.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(classify(GitOp::MergeBase, &out)),
        }
    }

    /// Paths changed between two commits (renames reported as delete plus add)
    pub fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        Ok(self
            .run(GitOp::Diff, &["--name-only", "--no-renames", from, to])?
            .lines())
    }

    /// File content at a revision; `None` when the path does not exist there
    pub fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>, GitError> {
        let spec = format!("{}:{}", rev, path);
        let out = self.run_unchecked(GitOp::Show, &[&spec])?;
        if out.success { Ok(Some(out.stdout)) } else { Ok(None) }
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{}", name);
        let out = self.run_unchecked(GitOp::RevParse, &["--verify", "--quiet", &reference])?;
        Ok(out.success)
    }

    pub fn create_branch(&self, name: &str, start: &str) -> Result<(), GitError> {
        info!(name, start, "Creating branch");
        self.run(GitOp::Branch, &[name, start])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(GitOp::Branch, &[flag, name])?;
        info!(name, force, "Deleted branch");
        Ok(())
    }

    /// Checked-out branch; `None` on a detached HEAD
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self.run(GitOp::Branch, &["--show-current"])?;
        let name = out.first_line();
        Ok(if name.is_empty() { None } else { Some(name.to_string()) })
    }

    pub fn has_remote(&self, remote: &str) -> Result<bool, GitError> {
        Ok(self.run_unchecked(GitOp::Remote, &["get-url", remote])?.success)
    }

    /// True when tracked files have uncommitted changes
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        let out = self.run(GitOp::Status, &["--porcelain", "--untracked-files=no"])?;
        Ok(!out.stdout.trim().is_empty())
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(1 << (attempt - 1).min(6));
    let jitter = rand::rng().random_range(0..=RETRY_JITTER_MS);
    exp + Duration::from_millis(jitter)
}

/// Wait for `child`, killing it once `timeout` elapses; `None` on timeout
pub(crate) fn wait_with_timeout(mut child: Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    let mut poll = POLL_START;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(poll.min(deadline - now));
        poll = (poll * 2).min(POLL_MAX);
    }
}

fn read_all(file: &mut File) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
