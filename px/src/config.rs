//! Parallax configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::domain::Phase;
use crate::domain::naming::{DEFAULT_PATTERN, validate_branch_name};

/// Project-local config file name, looked up in the repository root
pub const LOCAL_CONFIG: &str = ".parallax.yml";

/// Default state directory name under the repository root
pub const DEFAULT_STATE_DIR: &str = ".parallax";

/// Main Parallax configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State directory; relative paths resolve against the repository root
    #[serde(rename = "state-root")]
    pub state_root: Option<PathBuf>,

    /// Branch features merge into
    #[serde(rename = "integration-branch")]
    pub integration_branch: String,

    /// Remote used by publish
    pub remote: String,

    /// Bases that require signed evidence
    #[serde(rename = "protected-branches")]
    pub protected_branches: Vec<String>,

    /// Log level when RUST_LOG is unset
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    pub naming: NamingConfig,
    pub cache: CacheConfig,
    pub locks: LocksConfig,
    pub sessions: SessionsConfig,
    pub git: GitConfig,
    pub gates: GatesConfig,
    pub hooks: HooksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_root: None,
            integration_branch: "main".to_string(),
            remote: "origin".to_string(),
            protected_branches: vec!["main".to_string()],
            log_level: None,
            naming: NamingConfig::default(),
            cache: CacheConfig::default(),
            locks: LocksConfig::default(),
            sessions: SessionsConfig::default(),
            git: GitConfig::default(),
            gates: GatesConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// `--config` path, then `<repo>/.parallax.yml`, then
    /// `~/.config/parallax/parallax.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>, repo_root: &Path) -> Result<Self> {
        if let Some(path) = config_path {
            let config =
                Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }

        let local_config = repo_root.join(LOCAL_CONFIG);
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => {
                    config.validate()?;
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("parallax").join("parallax.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        config.validate()?;
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Read just the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>, repo_root: &Path) -> Option<String> {
        let candidates = [
            config_path.cloned(),
            Some(repo_root.join(LOCAL_CONFIG)),
            dirs::config_dir().map(|d| d.join("parallax").join("parallax.yml")),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .and_then(|c| c.log_level)
    }

    /// Check ranges and patterns early, before any state is touched
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = validate_branch_name(&self.integration_branch) {
            bail!("integration-branch: {}", e);
        }
        if self.remote.trim().is_empty() {
            bail!("remote must not be empty");
        }
        self.naming.validate()?;
        if self.cache.default_ttl_secs == 0 || self.cache.gate_ttl_secs == 0 {
            bail!("cache ttls must be greater than zero");
        }
        if self.locks.timeout_ms == 0 || self.locks.lease_secs == 0 {
            bail!("locks.timeout-ms and locks.lease-secs must be greater than zero");
        }
        if self.sessions.max_active_branches == 0 {
            bail!("sessions.max-active-branches must be at least 1");
        }
        if self.git.timeout_secs == 0 || self.git.network_timeout_secs == 0 {
            bail!("git timeouts must be greater than zero");
        }
        self.gates.validate()?;
        Ok(())
    }

    /// Absolute state directory for a repository
    pub fn state_root(&self, repo_root: &Path) -> PathBuf {
        match &self.state_root {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => repo_root.join(p),
            None => repo_root.join(DEFAULT_STATE_DIR),
        }
    }

    pub fn worktree_dir(&self, state_root: &Path) -> PathBuf {
        resolve_under(self.git.worktree_dir.as_deref(), state_root, "worktrees")
    }

    pub fn evidence_dir(&self, state_root: &Path) -> PathBuf {
        resolve_under(self.gates.evidence_dir.as_deref(), state_root, "evidence")
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.timeout_ms)
    }
}

fn resolve_under(configured: Option<&Path>, state_root: &Path, default: &str) -> PathBuf {
    match configured {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => state_root.join(p),
        None => state_root.join(default),
    }
}

/// Branch naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub prefix: String,

    /// Placeholders: {prefix} {phase} {session} {timestamp} {slug}
    pub pattern: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "feature".to_string(),
            pattern: DEFAULT_PATTERN.to_string(),
        }
    }
}

impl NamingConfig {
    fn validate(&self) -> Result<()> {
        if let Err(e) = validate_branch_name(&format!("{}/xx", self.prefix)) {
            bail!("naming.prefix: {}", e);
        }
        for required in ["{session}", "{timestamp}", "{slug}"] {
            if !self.pattern.contains(required) {
                bail!("naming.pattern must contain {}", required);
            }
        }
        Ok(())
    }
}

/// Cache ttls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "default-ttl-secs")]
    pub default_ttl_secs: u64,

    /// Ttl for gate results, kept short so reports are re-read
    #[serde(rename = "gate-ttl-secs")]
    pub gate_ttl_secs: u64,

    /// Per-category ttl in seconds
    #[serde(rename = "ttl-overrides")]
    pub ttl_overrides: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: sessionstore::DEFAULT_CACHE_TTL_SECS,
            gate_ttl_secs: 60,
            ttl_overrides: BTreeMap::new(),
        }
    }
}

/// Lock timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    #[serde(rename = "lease-secs")]
    pub lease_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            lease_secs: sessionstore::DEFAULT_LOCK_LEASE_SECS,
        }
    }
}

/// Session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    #[serde(rename = "max-active-branches")]
    pub max_active_branches: usize,

    #[serde(rename = "pause-after-mins")]
    pub pause_after_mins: u64,

    /// Sessions idle this long are reaped by `clean`
    #[serde(rename = "stale-after-hours")]
    pub stale_after_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_active_branches: 3,
            pause_after_mins: 60,
            stale_after_hours: 72,
        }
    }
}

/// Git adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Hard timeout for fetch, push and pull
    #[serde(rename = "network-timeout-secs")]
    pub network_timeout_secs: u64,

    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "use-worktrees")]
    pub use_worktrees: bool,

    #[serde(rename = "worktree-dir")]
    pub worktree_dir: Option<PathBuf>,

    #[serde(rename = "min-disk-space-mb")]
    pub min_disk_space_mb: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            network_timeout_secs: 120,
            max_retries: 3,
            use_worktrees: true,
            worktree_dir: None,
            min_disk_space_mb: 100,
        }
    }
}

/// A gate required before leaving a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GateSpec {
    /// Pass-marker with a minimum score
    Score {
        #[serde(default)]
        min: f64,
    },
    /// Line coverage percentage from an istanbul summary or Cobertura XML
    Coverage { report: PathBuf, min: f64 },
    /// Secret scan over touched files plus a dependency audit report
    Security {
        #[serde(default, rename = "audit-report")]
        audit_report: Option<PathBuf>,
        #[serde(default, rename = "max-vulnerabilities")]
        max_vulnerabilities: u64,
        #[serde(default, rename = "require-audit")]
        require_audit: bool,
        #[serde(default, rename = "extra-patterns")]
        extra_patterns: Vec<String>,
    },
    /// Metrics JSON checked against a YAML budget
    Performance { metrics: PathBuf, budget: PathBuf },
    /// Acceptance scenario report
    Scenario {
        report: PathBuf,
        #[serde(rename = "min-pass-rate")]
        min_pass_rate: f64,
    },
    /// Detached signatures over the pass-marker; only on protected bases
    Signature {
        #[serde(default = "default_min_signatures", rename = "min-signatures")]
        min_signatures: usize,
    },
}

fn default_min_signatures() -> usize {
    1
}

impl GateSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Score { .. } => "score",
            Self::Coverage { .. } => "coverage",
            Self::Security { .. } => "security",
            Self::Performance { .. } => "performance",
            Self::Scenario { .. } => "scenario",
            Self::Signature { .. } => "signature",
        }
    }
}

/// Gates and skip policy for one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseGates {
    /// May be jumped over by a forward skip
    pub skippable: bool,
    pub gates: Vec<GateSpec>,
}

/// Gate evidence and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    #[serde(rename = "evidence-dir")]
    pub evidence_dir: Option<PathBuf>,

    /// Evidence older than this is stale
    #[serde(rename = "max-age-hours")]
    pub max_age_hours: u64,

    #[serde(rename = "signature-program")]
    pub signature_program: String,

    pub phases: BTreeMap<Phase, PhaseGates>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        let phases = Phase::ALL
            .iter()
            .map(|&phase| {
                let gates = if phase == Phase::P0 {
                    Vec::new()
                } else {
                    vec![GateSpec::Score { min: 0.0 }]
                };
                let skippable = phase <= Phase::P2;
                (phase, PhaseGates { skippable, gates })
            })
            .collect();
        Self {
            evidence_dir: None,
            max_age_hours: 24,
            signature_program: "gpg".to_string(),
            phases,
        }
    }
}

impl GatesConfig {
    pub fn for_phase(&self, phase: Phase) -> PhaseGates {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.max_age_hours).unwrap_or(i64::MAX / 3_600_000))
    }

    fn validate(&self) -> Result<()> {
        if self.max_age_hours == 0 {
            bail!("gates.max-age-hours must be greater than zero");
        }
        for (phase, phase_gates) in &self.phases {
            let mut seen = Vec::new();
            for gate in &phase_gates.gates {
                if seen.contains(&gate.name()) {
                    bail!("gates.phases.{}: gate '{}' listed twice", phase, gate.name());
                }
                seen.push(gate.name());
                match gate {
                    GateSpec::Coverage { min, .. } if !(0.0..=100.0).contains(min) => {
                        bail!("gates.phases.{}: coverage min must be 0..=100", phase)
                    }
                    GateSpec::Scenario { min_pass_rate, .. } if !(0.0..=1.0).contains(min_pass_rate) => {
                        bail!("gates.phases.{}: min-pass-rate must be 0..=1", phase)
                    }
                    GateSpec::Security { extra_patterns, .. } => {
                        for pattern in extra_patterns {
                            regex::Regex::new(pattern)
                                .context(format!("gates.phases.{}: invalid security pattern", phase))?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Shell commands run on phase entry and exit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    #[serde(rename = "on-enter")]
    pub on_enter: BTreeMap<Phase, String>,

    #[serde(rename = "on-exit")]
    pub on_exit: BTreeMap<Phase, String>,

    /// A hook still running after this is killed
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            on_enter: BTreeMap::new(),
            on_exit: BTreeMap::new(),
            timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.integration_branch, "main");
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert_eq!(config.locks.timeout_ms, 5000);
        assert_eq!(config.sessions.max_active_branches, 3);
        assert!(config.gates.for_phase(Phase::P0).gates.is_empty());
        assert_eq!(config.gates.for_phase(Phase::P3).gates, vec![GateSpec::Score { min: 0.0 }]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
integration-branch: develop
protected-branches: [develop, release]
naming:
  prefix: work
cache:
  default-ttl-secs: 120
  ttl-overrides:
    repo: 600
locks:
  timeout-ms: 2000
sessions:
  max-active-branches: 5
git:
  use-worktrees: false
gates:
  max-age-hours: 12
  phases:
    P3:
      gates:
        - kind: score
          min: 7
        - kind: coverage
          report: coverage/coverage-summary.json
          min: 80
    P5:
      gates:
        - kind: signature
hooks:
  on-enter:
    P4: "make test"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.integration_branch, "develop");
        assert!(config.is_protected("release"));
        assert_eq!(config.naming.prefix, "work");
        assert_eq!(config.naming.pattern, DEFAULT_PATTERN);
        assert_eq!(config.cache.ttl_overrides.get("repo"), Some(&600));
        assert_eq!(config.locks.lease_secs, 30);
        assert!(!config.git.use_worktrees);
        assert_eq!(config.gates.for_phase(Phase::P3).gates.len(), 2);
        assert_eq!(
            config.gates.for_phase(Phase::P5).gates,
            vec![GateSpec::Signature { min_signatures: 1 }]
        );
        assert_eq!(config.hooks.on_enter.get(&Phase::P4).map(String::as_str), Some("make test"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.naming.pattern = "{prefix}/{session}".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sessions.max_active_branches = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gates.phases.insert(
            Phase::P4,
            PhaseGates {
                skippable: false,
                gates: vec![GateSpec::Coverage {
                    report: PathBuf::from("c.json"),
                    min: 120.0,
                }],
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_prefers_explicit_then_local() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(LOCAL_CONFIG), "remote: upstream\n").unwrap();
        let explicit = temp.path().join("other.yml");
        fs::write(&explicit, "remote: mirror\nlog-level: debug\n").unwrap();

        assert_eq!(Config::load(None, temp.path()).unwrap().remote, "upstream");
        assert_eq!(Config::load(Some(&explicit), temp.path()).unwrap().remote, "mirror");
        assert_eq!(
            Config::load_log_level(Some(&explicit), temp.path()).as_deref(),
            Some("debug")
        );
    }

    #[test]
    fn test_explicit_invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        let explicit = temp.path().join("bad.yml");
        fs::write(&explicit, "locks:\n  timeout-ms: [nope]\n").unwrap();
        assert!(Config::load(Some(&explicit), temp.path()).is_err());
    }

    #[test]
    fn test_paths_resolve_under_state_root() {
        let config = Config::default();
        let repo = Path::new("/repo");
        let state = config.state_root(repo);
        assert_eq!(state, PathBuf::from("/repo/.parallax"));
        assert_eq!(config.worktree_dir(&state), PathBuf::from("/repo/.parallax/worktrees"));
        assert_eq!(config.evidence_dir(&state), PathBuf::from("/repo/.parallax/evidence"));
    }
}
