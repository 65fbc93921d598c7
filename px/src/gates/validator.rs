//! Runs a phase's gates for a branch

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::evidence::{self, PassMarker};
use super::signature::{GpgVerifier, SignatureVerifier};
use super::{GateOutcome, coverage, performance, scenario, security, signature};
use crate::config::GateSpec;
use crate::context::{CACHE_GATES, Workspace};
use crate::domain::{Branch, GateEntry, GateRecord, Phase};
use crate::error::{PxResult, UnmetGate};
use crate::registry::BranchRegistry;

/// Outcome of one gate within a phase validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    #[serde(default)]
    pub value: Option<f64>,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
    /// Taken from the cache or the gate record instead of re-evaluated
    #[serde(default)]
    pub reused: bool,
}

/// All gates of one phase for one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseValidation {
    pub branch: String,
    pub phase: Phase,
    pub head: Option<String>,
    pub passed: bool,
    pub results: Vec<GateResult>,
}

impl PhaseValidation {
    pub fn unmet(&self) -> Vec<UnmetGate> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| UnmetGate {
                gate: r.gate.clone(),
                reason: r.detail.clone(),
            })
            .collect()
    }

    pub fn passed_gates(&self) -> Vec<String> {
        self.results.iter().filter(|r| r.passed).map(|r| r.gate.clone()).collect()
    }
}

/// Evaluates gates against evidence on disk
pub struct GateValidator<'a> {
    ws: &'a Workspace,
    verifier: Box<dyn SignatureVerifier + 'a>,
}

impl<'a> GateValidator<'a> {
    pub fn new(ws: &'a Workspace) -> Self {
        let verifier = Box::new(GpgVerifier::new(ws.config.gates.signature_program.clone()));
        Self { ws, verifier }
    }

    pub fn with_verifier(ws: &'a Workspace, verifier: Box<dyn SignatureVerifier + 'a>) -> Self {
        Self { ws, verifier }
    }

    /// Evaluate every configured gate without touching the gate record
    ///
    /// Passing results computed at the same head within the gate ttl are
    /// reused from the cache or the gate record.
    pub fn evaluate(&self, branch_name: &str, phase: Phase) -> PxResult<PhaseValidation> {
        debug!(%branch_name, %phase, "GateValidator::evaluate: called");
        let branch = BranchRegistry::new(self.ws).require(branch_name)?;
        let head = self.ws.git.rev_parse(branch_name).ok();
        let record = self.ws.store.load::<GateRecord>(branch_name)?;
        let specs = self.ws.config.gates.for_phase(phase).gates;

        let mut results = Vec::with_capacity(specs.len());
        for spec in &specs {
            let key = cache_key(branch_name, phase, spec.name(), head.as_deref());
            if let Some(reused) = self.reusable(&key, record.as_ref(), phase, spec.name(), head.as_deref()) {
                debug!(gate = spec.name(), "GateValidator::evaluate: reusing result");
                results.push(reused);
                continue;
            }

            let outcome = self.check(spec, &branch, phase);
            let result = GateResult {
                gate: spec.name().to_string(),
                passed: outcome.passed,
                value: outcome.value,
                detail: outcome.detail,
                checked_at: self.ws.now(),
                reused: false,
            };
            if result.passed
                && let Err(e) = self.ws.cache.set(CACHE_GATES, &key, &result, None)
            {
                warn!(gate = %result.gate, error = %e, "Could not cache gate result");
            }
            results.push(result);
        }

        let passed = results.iter().all(|r| r.passed);
        info!(branch = %branch_name, %phase, passed, gates = results.len(), "Validated phase gates");
        Ok(PhaseValidation {
            branch: branch_name.to_string(),
            phase,
            head,
            passed,
            results,
        })
    }

    /// Evaluate and append fresh results to the branch's gate record
    pub fn validate_phase(&self, branch_name: &str, phase: Phase) -> PxResult<PhaseValidation> {
        let validation = self.evaluate(branch_name, phase)?;
        self.record(&validation)?;
        Ok(validation)
    }

    /// Append the non-reused results of `validation` to the gate record
    pub fn record(&self, validation: &PhaseValidation) -> PxResult<()> {
        let fresh: Vec<&GateResult> = validation.results.iter().filter(|r| !r.reused).collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let mut record = self
            .ws
            .store
            .load::<GateRecord>(&validation.branch)?
            .unwrap_or_else(|| GateRecord::new(&validation.branch));
        for result in fresh {
            record.entries.push(GateEntry {
                phase: validation.phase,
                gate: result.gate.clone(),
                passed: result.passed,
                value: result.value,
                detail: result.detail.clone(),
                head: validation.head.clone(),
                checked_at: result.checked_at,
            });
        }
        self.ws.store.save(&record)?;
        Ok(())
    }

    fn reusable(
        &self,
        key: &str,
        record: Option<&GateRecord>,
        phase: Phase,
        gate: &str,
        head: Option<&str>,
    ) -> Option<GateResult> {
        head?;
        if let Some(mut cached) = self.ws.cache.get_as::<GateResult>(CACHE_GATES, key)
            && cached.passed
        {
            cached.reused = true;
            return Some(cached);
        }
        let entry = record?.latest(phase, gate)?;
        let ttl = chrono::Duration::from_std(self.ws.cache.ttl_for(CACHE_GATES)).ok()?;
        let fresh = self.ws.now() - entry.checked_at <= ttl;
        (entry.passed && fresh && entry.head.as_deref() == head).then(|| GateResult {
            gate: entry.gate.clone(),
            passed: true,
            value: entry.value,
            detail: entry.detail.clone(),
            checked_at: entry.checked_at,
            reused: true,
        })
    }

    fn check(&self, spec: &GateSpec, branch: &Branch, phase: Phase) -> GateOutcome {
        let evidence_dir = evidence::branch_dir(&self.ws.evidence_dir(), &branch.name);
        let work_dir = self.ws.work_dir(branch);
        let now = self.ws.now();
        let max_age = self.ws.config.gates.max_age();

        match spec {
            GateSpec::Score { min } => check_score(&evidence_dir, phase, *min, now, max_age),
            GateSpec::Coverage { report, min } => {
                let report = resolve(&work_dir, report);
                match evidence::check_fresh(&report, now, max_age) {
                    Ok(()) => coverage::check(&report, *min),
                    Err(e) => GateOutcome::fail(None, e),
                }
            }
            GateSpec::Security {
                audit_report,
                max_vulnerabilities,
                require_audit,
                extra_patterns,
            } => {
                let extra: Vec<Regex> = extra_patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
                let findings = match security::scan_branch(&self.ws.git, &branch.name, &branch.base, &extra) {
                    Ok(findings) => findings,
                    Err(e) => return GateOutcome::fail(None, format!("secret scan failed: {}", e)),
                };
                let audit = audit_report.as_ref().map(|p| {
                    let path = resolve(&work_dir, p);
                    evidence::check_fresh(&path, now, max_age).and_then(|()| security::count_vulnerabilities(&path))
                });
                security::evaluate(&findings, audit, *max_vulnerabilities, *require_audit)
            }
            GateSpec::Performance { metrics, budget } => {
                let metrics = resolve(&work_dir, metrics);
                match evidence::check_fresh(&metrics, now, max_age) {
                    Ok(()) => performance::check(&metrics, &resolve(&work_dir, budget)),
                    Err(e) => GateOutcome::fail(None, e),
                }
            }
            GateSpec::Scenario { report, min_pass_rate } => {
                let report = resolve(&work_dir, report);
                match evidence::check_fresh(&report, now, max_age) {
                    Ok(()) => scenario::check(&report, *min_pass_rate),
                    Err(e) => GateOutcome::fail(None, e),
                }
            }
            GateSpec::Signature { min_signatures } => {
                let protected = self
                    .ws
                    .config
                    .is_protected(&branch.base)
                    .then_some(branch.base.as_str());
                signature::check(self.verifier.as_ref(), &evidence_dir, phase, *min_signatures, protected)
            }
        }
    }
}

fn check_score(evidence_dir: &Path, phase: Phase, min: f64, now: DateTime<Utc>, max_age: chrono::Duration) -> GateOutcome {
    let path = evidence::marker_path(evidence_dir, phase);
    if !path.is_file() {
        return GateOutcome::fail(None, format!("no pass-marker at {}", path.display()));
    }
    let marker = match PassMarker::read(&path) {
        Ok(marker) => marker,
        Err(e) => return GateOutcome::fail(None, e),
    };
    if marker.phase != phase {
        return GateOutcome::fail(None, format!("pass-marker is for {}, not {}", marker.phase, phase));
    }
    if now - marker.recorded_at > max_age {
        return GateOutcome::fail(
            Some(marker.score),
            format!("pass-marker is stale (recorded {})", marker.recorded_at.format("%Y-%m-%d %H:%M")),
        );
    }
    if marker.score < min {
        return GateOutcome::fail(Some(marker.score), format!("score {} < {}", marker.score, min));
    }
    GateOutcome::pass(
        Some(marker.score),
        format!("score {} >= {} (by {})", marker.score, min, marker.recorded_by),
    )
}

fn resolve(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}

fn cache_key(branch: &str, phase: Phase, gate: &str, head: Option<&str>) -> String {
    format!("{}:{}:{}:{}", branch, phase, gate, head.unwrap_or("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PhaseGates};
    use crate::registry::CreateBranch;
    use crate::testutil::setup_git_repo;
    use sessionstore::ManualClock;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const BRANCH: &str = "feature/P3-t1-auth";

    fn workspace(repo: &Path, config: Config) -> (Workspace, Arc<ManualClock>) {
        setup_git_repo(repo);
        let clock = Arc::new(ManualClock::starting_now());
        let ws = Workspace::open(config, repo, clock.clone()).unwrap();
        BranchRegistry::new(&ws)
            .create(&CreateBranch {
                name: BRANCH.to_string(),
                session_id: "t1".to_string(),
                phase: Phase::P3,
                description: "auth".to_string(),
                base: None,
            })
            .unwrap();
        (ws, clock)
    }

    fn config_with(phase: Phase, gates: Vec<GateSpec>) -> Config {
        let mut config = Config::default();
        config.git.use_worktrees = false;
        config.gates.phases.insert(phase, PhaseGates { skippable: false, gates });
        config
    }

    fn write_marker(ws: &Workspace, phase: Phase, score: f64, at: DateTime<Utc>) {
        let dir = evidence::branch_dir(&ws.evidence_dir(), BRANCH);
        PassMarker::new(phase, score, "t1", at)
            .write(&evidence::marker_path(&dir, phase))
            .unwrap();
    }

    #[test]
    fn test_missing_marker_fails() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 7.0 }]));

        let validation = GateValidator::new(&ws).evaluate(BRANCH, Phase::P3).unwrap();
        assert!(!validation.passed);
        assert_eq!(validation.unmet()[0].gate, "score");
        assert!(validation.unmet()[0].reason.contains("no pass-marker"));
    }

    #[test]
    fn test_score_threshold() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 7.0 }]));

        write_marker(&ws, Phase::P3, 6.5, ws.now());
        assert!(!GateValidator::new(&ws).evaluate(BRANCH, Phase::P3).unwrap().passed);

        write_marker(&ws, Phase::P3, 8.0, ws.now());
        let validation = GateValidator::new(&ws).evaluate(BRANCH, Phase::P3).unwrap();
        assert!(validation.passed);
        assert_eq!(validation.passed_gates(), vec!["score".to_string()]);
    }

    #[test]
    fn test_stale_marker_fails() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 0.0 }]));

        write_marker(&ws, Phase::P3, 9.0, ws.now() - chrono::Duration::hours(25));
        let validation = GateValidator::new(&ws).evaluate(BRANCH, Phase::P3).unwrap();
        assert!(!validation.passed);
        assert!(validation.results[0].detail.contains("stale"));
    }

    #[test]
    fn test_marker_for_wrong_phase_fails() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 0.0 }]));

        let dir = evidence::branch_dir(&ws.evidence_dir(), BRANCH);
        PassMarker::new(Phase::P2, 9.0, "t1", ws.now())
            .write(&evidence::marker_path(&dir, Phase::P3))
            .unwrap();
        assert!(!GateValidator::new(&ws).evaluate(BRANCH, Phase::P3).unwrap().passed);
    }

    #[test]
    fn test_validate_phase_records_and_reuses() {
        let repo = tempdir().unwrap();
        let (ws, clock) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 0.0 }]));
        write_marker(&ws, Phase::P3, 9.0, ws.now());
        let validator = GateValidator::new(&ws);

        let first = validator.validate_phase(BRANCH, Phase::P3).unwrap();
        assert!(first.passed);
        assert!(!first.results[0].reused);
        let record = ws.store.load::<GateRecord>(BRANCH).unwrap().unwrap();
        assert_eq!(record.entries.len(), 1);
        assert_eq!(record.latest(Phase::P3, "score").unwrap().head, first.head);

        let second = validator.validate_phase(BRANCH, Phase::P3).unwrap();
        assert!(second.results[0].reused);
        assert_eq!(ws.store.load::<GateRecord>(BRANCH).unwrap().unwrap().entries.len(), 1);

        // past the gate ttl the gate is evaluated again
        clock.advance(Duration::from_secs(61));
        let third = validator.validate_phase(BRANCH, Phase::P3).unwrap();
        assert!(!third.results[0].reused);
        assert_eq!(ws.store.load::<GateRecord>(BRANCH).unwrap().unwrap().entries.len(), 2);
    }

    #[test]
    fn test_failing_results_are_not_reused() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P3, vec![GateSpec::Score { min: 0.0 }]));
        let validator = GateValidator::new(&ws);

        assert!(!validator.validate_phase(BRANCH, Phase::P3).unwrap().passed);
        write_marker(&ws, Phase::P3, 9.0, ws.now());
        assert!(validator.validate_phase(BRANCH, Phase::P3).unwrap().passed);
    }

    #[test]
    fn test_coverage_report_resolves_against_work_dir() {
        let repo = tempdir().unwrap();
        let gates = vec![GateSpec::Coverage {
            report: PathBuf::from("coverage/coverage-summary.json"),
            min: 80.0,
        }];
        let (ws, _) = workspace(repo.path(), config_with(Phase::P4, gates));
        fs::create_dir_all(repo.path().join("coverage")).unwrap();
        fs::write(
            repo.path().join("coverage/coverage-summary.json"),
            r#"{"total":{"lines":{"pct":91.0}}}"#,
        )
        .unwrap();

        let validation = GateValidator::new(&ws).evaluate(BRANCH, Phase::P4).unwrap();
        assert!(validation.passed, "{:?}", validation.results);
        assert_eq!(validation.results[0].value, Some(91.0));
    }

    #[test]
    fn test_signature_only_on_protected_base() {
        let repo = tempdir().unwrap();
        let mut config = config_with(Phase::P5, vec![GateSpec::Signature { min_signatures: 1 }]);
        config.protected_branches.clear();
        let (ws, _) = workspace(repo.path(), config);
        assert!(GateValidator::new(&ws).evaluate(BRANCH, Phase::P5).unwrap().passed);
    }

    #[test]
    fn test_phase_without_gates_passes() {
        let repo = tempdir().unwrap();
        let (ws, _) = workspace(repo.path(), config_with(Phase::P0, Vec::new()));
        let validation = GateValidator::new(&ws).evaluate(BRANCH, Phase::P0).unwrap();
        assert!(validation.passed);
        assert!(validation.results.is_empty());
    }
}
