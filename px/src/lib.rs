//! Parallax - coordinates concurrent development sessions on one repository
//!
//! Several terminals work on the same repository at once. Each terminal owns a
//! session that moves through phases P0-P7 on its own branch, and every piece
//! of shared state lives in files so uncoordinated processes see one truth.
//!
//! # Core Concepts
//!
//! - **Sessions own branches**: only the owning session writes a branch record
//! - **Gates before phases**: a phase is left only when its gates pass, or an audited override says so
//! - **Overlap before merge**: branches touching the same files are reported early; manual conflicts block merges
//! - **Files are authoritative**: locks, cache and audit live beside the records; the cache is never trusted over them
//!
//! # Modules
//!
//! - [`domain`] - sessions, branches, phases and global state
//! - [`registry`] - branch naming, creation and retirement
//! - [`phase`] - phase transitions and hooks
//! - [`gates`] - gate checks and evidence
//! - [`conflict`] - overlap detection between branches
//! - [`dispatch`] - cleanup workers
//! - [`commands`] - the `px` subcommands
//! - [`git`] - git subprocess runner, worktrees and merges
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod commands;
pub mod config;
pub mod conflict;
pub mod context;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod gates;
pub mod git;
pub mod phase;
pub mod registry;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use context::Workspace;
pub use error::{PxError, PxResult};
