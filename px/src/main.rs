//! Parallax - multi-session development orchestration
//!
//! CLI entry point. Each invocation is a short-lived process that opens the
//! shared state directory, runs one command and exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::debug;

use parallax::cli::{Cli, Command, OutputFormat};
use parallax::commands::{
    MergeOptions, cmd_backup, cmd_clean, cmd_close, cmd_merge, cmd_next, cmd_publish, cmd_restore, cmd_start,
    cmd_status, cmd_validate,
};
use parallax::config::Config;
use parallax::context::Workspace;
use parallax::error::{EXIT_FAILURE, PxError};
use parallax::git::GitRunner;
use sessionstore::system_clock;

fn setup_logging(log_dir: &Path, verbose: bool, config_log_level: Option<&str>) -> Result<()> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        match config_log_level.map(str::to_uppercase).as_deref() {
            Some("TRACE") => tracing::Level::TRACE,
            Some("DEBUG") => tracing::Level::DEBUG,
            Some("WARN") | Some("WARNING") => tracing::Level::WARN,
            Some("ERROR") => tracing::Level::ERROR,
            Some("INFO") | None => tracing::Level::INFO,
            Some(other) => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
                tracing::Level::INFO
            }
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("px.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

fn repo_root(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    let start = match explicit {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let root = GitRunner::discover(&start).map_err(PxError::from)?;
    Ok(root)
}

fn run(cli: Cli) -> Result<()> {
    let repo = repo_root(cli.repo.as_ref())?;
    let config_log_level = Config::load_log_level(cli.config.as_ref(), &repo);
    let config = Config::load(cli.config.as_ref(), &repo).context("Failed to load configuration")?;

    setup_logging(&config.state_root(&repo).join("logs"), cli.verbose, config_log_level.as_deref())
        .context("Failed to setup logging")?;

    let ws = Workspace::open(config, &repo, system_clock())?;
    let terminal = cli.terminal.as_str();

    debug!(command = ?cli.command, %terminal, "main: dispatching command");
    match cli.command {
        Command::Start { name, phase, base } => cmd_start(&ws, terminal, &name, phase, base)?,
        Command::Status { json } => cmd_status(&ws, terminal, cli.verbose, OutputFormat::from_flag(json))?,
        Command::Validate { phase } => cmd_validate(&ws, terminal, phase)?,
        Command::Next {
            dry_run,
            force,
            to,
            reason,
        } => cmd_next(&ws, terminal, dry_run, force, to, reason)?,
        Command::Publish { draft, base } => cmd_publish(&ws, terminal, draft, base)?,
        Command::Merge {
            branch,
            squash,
            no_delete,
            force,
            reason,
        } => {
            let opts = MergeOptions {
                squash,
                no_delete,
                force,
                reason,
                actor: terminal.to_string(),
            };
            cmd_merge(&ws, &branch, &opts)?
        }
        Command::Clean { dry_run, force } => cmd_clean(&ws, terminal, dry_run, force)?,
        Command::Close => cmd_close(&ws, terminal)?,
        Command::Backup => cmd_backup(&ws)?,
        Command::Restore { snapshot } => cmd_restore(&ws, terminal, &snapshot)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(report) = run(cli) {
        eprintln!("{} {:#}", "error:".red().bold(), report);
        let code = match report.downcast_ref::<PxError>() {
            Some(err) => {
                if let Some(hint) = err.hint() {
                    eprintln!("  {} {}", "hint:".yellow(), hint);
                }
                err.exit_code()
            }
            None => EXIT_FAILURE,
        };
        process::exit(code);
    }
}
