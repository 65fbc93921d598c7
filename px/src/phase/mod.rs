//! Phase lifecycle: gated transitions and the hooks fired around them

mod engine;
mod hooks;

pub use engine::{PhaseEngine, TransitionOptions, TransitionOutcome};
pub use hooks::{HookContext, PhaseHooks, ShellHooks};
