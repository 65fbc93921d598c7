//! Gate validation
//!
//! Each gate kind reads evidence from disk (pass-markers, coverage, audit,
//! metrics and scenario reports, signatures) and yields a [`GateOutcome`].
//! [`GateValidator`] runs a phase's configured gates for a branch.

pub mod coverage;
pub mod evidence;
pub mod performance;
pub mod scenario;
pub mod security;
pub mod signature;
mod validator;

pub use evidence::PassMarker;
pub use signature::{GpgVerifier, SignatureVerifier};
pub use validator::{GateResult, GateValidator, PhaseValidation};

/// Result of evaluating one gate
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub passed: bool,
    pub value: Option<f64>,
    pub detail: String,
}

impl GateOutcome {
    pub fn pass(value: Option<f64>, detail: String) -> Self {
        Self {
            passed: true,
            value,
            detail,
        }
    }

    pub fn fail(value: Option<f64>, detail: String) -> Self {
        Self {
            passed: false,
            value,
            detail,
        }
    }
}
