//! Acceptance scenario pass rate

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::GateOutcome;

#[derive(Debug, Deserialize)]
struct ScenarioReport {
    passed: u64,
    #[serde(default)]
    failed: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
}

/// Pass rate from a `{passed, failed}` or `{passed, total}` report
pub fn pass_rate(path: &Path) -> Result<f64, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let report: ScenarioReport =
        serde_json::from_str(&content).map_err(|e| format!("malformed scenario report: {}", e))?;
    let total = match (report.total, report.failed) {
        (Some(total), _) => total,
        (None, Some(failed)) => report.passed + failed,
        (None, None) => return Err("scenario report needs `failed` or `total`".to_string()),
    };
    if total == 0 {
        return Err("scenario report lists no scenarios".to_string());
    }
    if report.passed > total {
        return Err(format!("passed ({}) exceeds total ({})", report.passed, total));
    }
    Ok(report.passed as f64 / total as f64)
}

pub fn check(report: &Path, min_pass_rate: f64) -> GateOutcome {
    match pass_rate(report) {
        Ok(rate) if rate >= min_pass_rate => {
            GateOutcome::pass(Some(rate), format!("pass rate {:.2} >= {:.2}", rate, min_pass_rate))
        }
        Ok(rate) => GateOutcome::fail(Some(rate), format!("pass rate {:.2} < {:.2}", rate, min_pass_rate)),
        Err(e) => GateOutcome::fail(None, e),
    }
}
