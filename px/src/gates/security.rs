//! Secret scan over touched files plus a dependency audit report

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::GateOutcome;
use crate::git::{GitError, GitRunner};

/// Files larger than this are not scanned
const MAX_SCAN_BYTES: usize = 1024 * 1024;

fn builtin_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("private-key", r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP |ENCRYPTED )?PRIVATE KEY-----"),
            ("aws-access-key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
            (
                "generic-secret",
                r#"(?i)\b(?:api[_-]?key|secret|token|passw(?:or)?d)\b\s*[:=]\s*["'][^"'\s]{8,}["']"#,
            ),
        ]
        .into_iter()
        .map(|(name, re)| (name, Regex::new(re).expect("valid secret pattern")))
        .collect()
    })
}

/// One suspected secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub path: String,
    pub line: usize,
    pub pattern: String,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.path, self.line, self.pattern)
    }
}

/// Scan text for secrets; extra patterns are assumed valid (checked at config load)
pub fn scan_text(path: &str, content: &str, extra: &[Regex]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let builtin = builtin_patterns().iter().map(|(name, re)| (name.to_string(), re));
        let custom = extra.iter().map(|re| (format!("custom:{}", re.as_str()), re));
        for (name, re) in builtin.chain(custom) {
            if re.is_match(line) {
                findings.push(Finding {
                    path: path.to_string(),
                    line: idx + 1,
                    pattern: name,
                });
            }
        }
    }
    findings
}

/// Scan every file `branch` changed since it left `base`
pub fn scan_branch(git: &GitRunner, branch: &str, base: &str, extra: &[Regex]) -> Result<Vec<Finding>, GitError> {
    let Some(fork) = git.merge_base(base, branch)? else {
        return Ok(Vec::new());
    };
    let mut findings = Vec::new();
    for path in git.changed_files(&fork, branch)? {
        let Some(content) = git.show_file(branch, &path)? else {
            continue;
        };
        if content.len() > MAX_SCAN_BYTES {
            debug!(%path, "security::scan_branch: skipping large file");
            continue;
        }
        findings.extend(scan_text(&path, &content, extra));
    }
    Ok(findings)
}

/// Vulnerability count from `cargo audit --json` or `npm audit --json` output
pub fn count_vulnerabilities(path: &Path) -> Result<u64, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| format!("malformed audit report: {}", e))?;

    // cargo audit
    if let Some(count) = value.pointer("/vulnerabilities/count").and_then(serde_json::Value::as_u64) {
        return Ok(count);
    }
    // npm audit (v7+)
    if let Some(counts) = value.pointer("/metadata/vulnerabilities").and_then(|v| v.as_object()) {
        if let Some(total) = counts.get("total").and_then(serde_json::Value::as_u64) {
            return Ok(total);
        }
        return Ok(counts.values().filter_map(serde_json::Value::as_u64).sum());
    }
    Err("unrecognised audit report shape".to_string())
}

/// Combine scan findings with the audit report
pub fn evaluate(findings: &[Finding], audit: Option<Result<u64, String>>, max_vulnerabilities: u64, require_audit: bool) -> GateOutcome {
    if !findings.is_empty() {
        let listed: Vec<String> = findings.iter().take(5).map(Finding::to_string).collect();
        return GateOutcome::fail(
            Some(findings.len() as f64),
            format!("{} suspected secret(s): {}", findings.len(), listed.join(", ")),
        );
    }
    match audit {
        None if require_audit => GateOutcome::fail(None, "no dependency audit report configured".to_string()),
        None => GateOutcome::pass(Some(0.0), "no secrets found; no audit report".to_string()),
        Some(Err(e)) => GateOutcome::fail(None, e),
        Some(Ok(count)) if count <= max_vulnerabilities => GateOutcome::pass(
            Some(count as f64),
            format!("no secrets found; {} vulnerabilities <= {}", count, max_vulnerabilities),
        ),
        Some(Ok(count)) => GateOutcome::fail(
            Some(count as f64),
            format!("{} vulnerabilities > {}", count, max_vulnerabilities),
        ),
    }
}
