//! Performance metrics checked against a budget

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::GateOutcome;

/// Load `name → number` metrics from JSON
pub fn load_metrics(path: &Path) -> Result<BTreeMap<String, f64>, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("malformed metrics {}: {}", path.display(), e))
}

/// Load `name → max` budget from YAML
pub fn load_budget(path: &Path) -> Result<BTreeMap<String, f64>, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&content).map_err(|e| format!("malformed budget {}: {}", path.display(), e))
}

/// Every budgeted metric must be present and within its maximum
pub fn compare(metrics: &BTreeMap<String, f64>, budget: &BTreeMap<String, f64>) -> GateOutcome {
    let mut violations = Vec::new();
    for (name, max) in budget {
        match metrics.get(name) {
            None => violations.push(format!("{} missing", name)),
            Some(value) if value > max => violations.push(format!("{} {} > {}", name, value, max)),
            Some(_) => {}
        }
    }
    if violations.is_empty() {
        GateOutcome::pass(Some(0.0), format!("{} metric(s) within budget", budget.len()))
    } else {
        GateOutcome::fail(Some(violations.len() as f64), violations.join(", "))
    }
}

pub fn check(metrics: &Path, budget: &Path) -> GateOutcome {
    match (load_metrics(metrics), load_budget(budget)) {
        (Ok(metrics), Ok(budget)) => compare(&metrics, &budget),
        (Err(e), _) | (_, Err(e)) => GateOutcome::fail(None, e),
    }
}
