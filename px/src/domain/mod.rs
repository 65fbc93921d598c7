//! Domain types for Parallax
//!
//! Session, Branch, GlobalState and GateRecord all implement the sessionstore
//! `Record` trait and persist as one JSON file each.

mod branch;
mod gate;
mod global;
pub mod naming;
mod phase;
mod session;

pub use branch::{Branch, BranchStatus, PublishInfo, RecordedConflict};
pub use gate::{GateEntry, GateRecord};
pub use global::{GLOBAL_ID, GlobalState, Totals, branch_claim};
pub use phase::Phase;
pub use session::{PhaseChange, Session, SessionMetrics, SessionStatus, TransitionKind, validate_session_id};
