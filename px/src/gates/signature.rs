//! Detached signatures over a pass-marker

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use super::GateOutcome;
use super::evidence::{approvals_dir, marker_path, signature_path};
use crate::domain::Phase;
use crate::git::wait_with_timeout;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks one detached signature against the data it covers
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signature: &Path, data: &Path) -> Result<bool, String>;
}

/// Verifies with `gpg --verify` (or a compatible program)
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    program: String,
}

impl GpgVerifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl SignatureVerifier for GpgVerifier {
    fn verify(&self, signature: &Path, data: &Path) -> Result<bool, String> {
        debug!(program = %self.program, ?signature, "GpgVerifier::verify: called");
        let child = Command::new(&self.program)
            .arg("--batch")
            .arg("--verify")
            .arg(signature)
            .arg(data)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("cannot run {}: {}", self.program, e))?;
        match wait_with_timeout(child, VERIFY_TIMEOUT) {
            Ok(Some(status)) => Ok(status.success()),
            Ok(None) => Err(format!("{} timed out", self.program)),
            Err(e) => Err(format!("{} failed: {}", self.program, e)),
        }
    }
}

/// Signature files for a phase: `P<n>.pass.sig` then `P<n>.approvals/*.sig`
pub fn signature_files(branch_dir: &Path, phase: Phase) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let primary = signature_path(branch_dir, phase);
    if primary.is_file() {
        files.push(primary);
    }
    let pattern = approvals_dir(branch_dir, phase).join("*.sig");
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => {
            let mut approvals: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
            approvals.sort();
            files.extend(approvals);
        }
        Err(e) => warn!(?pattern, error = %e, "Invalid approvals pattern"),
    }
    files
}

/// Count valid signatures over the phase's pass-marker
///
/// Signatures are only demanded when the branch forks from a protected base.
pub fn check(
    verifier: &dyn SignatureVerifier,
    branch_dir: &Path,
    phase: Phase,
    min_signatures: usize,
    protected_base: Option<&str>,
) -> GateOutcome {
    let Some(base) = protected_base else {
        return GateOutcome::pass(None, "not required for unprotected base".to_string());
    };
    let marker = marker_path(branch_dir, phase);
    if !marker.is_file() {
        return GateOutcome::fail(Some(0.0), format!("no pass-marker to verify at {}", marker.display()));
    }

    let mut valid = 0usize;
    let mut problems = Vec::new();
    for sig in signature_files(branch_dir, phase) {
        match verifier.verify(&sig, &marker) {
            Ok(true) => valid += 1,
            Ok(false) => problems.push(format!("{} invalid", file_name(&sig))),
            Err(e) => problems.push(e),
        }
    }

    if valid >= min_signatures {
        GateOutcome::pass(
            Some(valid as f64),
            format!("{} valid signature(s) for protected base {}", valid, base),
        )
    } else {
        let mut detail = format!("{} valid signature(s), {} required for {}", valid, min_signatures, base);
        if !problems.is_empty() {
            detail.push_str(&format!(" ({})", problems.join(", ")));
        }
        GateOutcome::fail(Some(valid as f64), detail)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
