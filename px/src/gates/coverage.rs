//! Line coverage from istanbul summaries or Cobertura XML

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::GateOutcome;

fn line_rate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<coverage\b[^>]*?\sline-rate="([0-9]*\.?[0-9]+)""#).expect("valid regex"))
}

/// Line coverage percentage in a report
///
/// JSON is read as an istanbul `coverage-summary.json` (`total.lines.pct`);
/// anything else is treated as Cobertura XML (`line-rate`, a 0..1 ratio).
pub fn parse_percent(path: &Path) -> Result<f64, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| format!("malformed coverage summary: {}", e))?;
        value
            .pointer("/total/lines/pct")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| "coverage summary has no total.lines.pct".to_string())
    } else {
        let caps = line_rate_re()
            .captures(&content)
            .ok_or_else(|| "Cobertura report has no line-rate".to_string())?;
        let rate: f64 = caps[1].parse().map_err(|_| "unparseable line-rate".to_string())?;
        Ok(rate * 100.0)
    }
}

pub fn check(report: &Path, min: f64) -> GateOutcome {
    match parse_percent(report) {
        Ok(pct) if pct >= min => GateOutcome::pass(Some(pct), format!("{:.1}% >= {:.1}%", pct, min)),
        Ok(pct) => GateOutcome::fail(Some(pct), format!("{:.1} < {:.1}", pct, min)),
        Err(e) => GateOutcome::fail(None, e),
    }
}
