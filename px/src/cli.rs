//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::Phase;

/// Default session id when neither `--terminal` nor `PX_TERMINAL` is given
pub const DEFAULT_TERMINAL: &str = "t1";

/// Parallax - multi-session development orchestration
#[derive(Debug, Parser)]
#[command(
    name = "px",
    about = "Coordinates concurrent development sessions on one repository",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Debug logging; `status` also shows locks, claims and cache counters
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Session id of this terminal
    #[arg(long, global = true, env = "PX_TERMINAL", default_value = DEFAULT_TERMINAL)]
    pub terminal: String,

    /// Repository to operate on (defaults to the enclosing repository)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or resume this terminal's session and start a branch
    Start {
        /// Short description used in the branch name
        name: String,

        /// Phase of a new session (defaults to P0; a resumed session keeps its phase)
        #[arg(short, long)]
        phase: Option<Phase>,

        /// Fork point (defaults to the integration branch)
        #[arg(long)]
        base: Option<String>,
    },

    /// Show sessions, branches and overlaps (`--verbose` adds locks, claims and cache counters)
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the gates for this session's branch
    Validate {
        /// Phase to validate (defaults to the current phase)
        #[arg(short, long)]
        phase: Option<Phase>,
    },

    /// Advance to the next phase
    Next {
        /// Report what would happen without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Bypass failing gates, non-skippable phases, or move backward
        #[arg(long)]
        force: bool,

        /// Target phase for a skip or an override
        #[arg(long)]
        to: Option<Phase>,

        /// Why a forced move is needed (recorded in the audit log)
        #[arg(long)]
        reason: Option<String>,
    },

    /// Report conflicts and push this session's branch
    Publish {
        /// Record the publish as a draft
        #[arg(long)]
        draft: bool,

        /// Branch the change targets (defaults to the branch's base)
        #[arg(long)]
        base: Option<String>,
    },

    /// Merge a branch into the integration branch
    Merge {
        /// Branch to merge
        branch: String,

        /// Collapse the branch into one commit
        #[arg(long)]
        squash: bool,

        /// Keep the git branch and its worktree after merging
        #[arg(long)]
        no_delete: bool,

        /// Merge despite manual conflicts with the integration branch
        #[arg(long)]
        force: bool,

        /// Why the conflict check is overridden
        #[arg(long)]
        reason: Option<String>,
    },

    /// Reap stale sessions, prune branches and worktrees, break stale locks
    Clean {
        /// Report what would be removed
        #[arg(long)]
        dry_run: bool,

        /// Abandon unmerged branches of reaped sessions
        #[arg(long)]
        force: bool,
    },

    /// Close and archive this terminal's session
    Close,

    /// Snapshot the state directory
    Backup,

    /// Replace state with a snapshot taken by `backup`
    Restore {
        /// Snapshot name as printed by `backup`
        snapshot: String,
    },
}

/// Output format for status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
