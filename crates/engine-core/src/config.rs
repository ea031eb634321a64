//! Configuration parsing for the supervisor engine.
//!
//! Uses the same hand-rolled `key = value` line format this codebase has
//! always used (not TOML/YAML), extended with dotted/bracketed keys for
//! the namespaced sections the engine needs (Section 6, "Configuration
//! inputs"). Precedence: CLI flags > `--config` file > defaults.

use crate::scope::ScopeLock;
use crate::types::{CaptureMode, OrchestrationPolicy, QueuePolicy, WorkerOutput};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerConfig {
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub output: WorkerOutput,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("true"),
            args: Vec::new(),
            output: WorkerOutput::Text,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct VerificationConfig {
    pub tier0: Vec<String>,
    pub tier1: Vec<String>,
    pub tier2: Vec<String>,
    pub risk_triggers: Vec<String>,
    pub max_verify_time_per_milestone: u32,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PhaseWorkers {
    pub plan: String,
    pub implement: String,
    pub review: String,
}

impl Default for PhaseWorkers {
    fn default() -> Self {
        Self {
            plan: "default".to_string(),
            implement: "default".to_string(),
            review: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResilienceConfig {
    pub auto_resume: bool,
    pub max_auto_resumes: u32,
    pub max_worker_call_minutes: u32,
    pub max_review_rounds: u32,
    pub auto_resume_delays_ms: Vec<u64>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            auto_resume: false,
            max_auto_resumes: 0,
            max_worker_call_minutes: 45,
            max_review_rounds: 2,
            auto_resume_delays_ms: vec![1000, 5000, 30000],
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReceiptsConfig {
    pub redact: bool,
    pub capture_cmd_output: CaptureMode,
    pub max_output_bytes: usize,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            redact: true,
            capture_cmd_output: CaptureMode::Truncated,
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowConfig {
    pub mode: String,
    pub integration_branch: String,
    pub release_branch: Option<String>,
    pub submit_strategy: String,
    pub protected_branches: Vec<String>,
    pub require_clean_tree: bool,
    pub require_verification: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            mode: "single".to_string(),
            integration_branch: "main".to_string(),
            release_branch: None,
            submit_strategy: "cherry_pick".to_string(),
            protected_branches: vec!["main".to_string()],
            require_clean_tree: true,
            require_verification: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub runs_root: PathBuf,

    pub scope: ScopeLock,
    pub verification: VerificationConfig,
    pub workers: BTreeMap<String, WorkerConfig>,
    pub phases: PhaseWorkers,
    pub resilience: ResilienceConfig,
    pub receipts: ReceiptsConfig,
    pub workflow: WorkflowConfig,

    // Resource caps (Section 5), flat keys.
    pub max_run_wall_minutes: u32,
    pub max_ticks: u32,
    pub stall_threshold_minutes: u32,
    pub max_milestone_retries: u32,

    /// Mirrors the `--allow-deps` CLI flag (Section 4.2): when `false`,
    /// paths in the lockfile set are immutable during IMPLEMENT.
    pub allow_deps_flag: bool,

    pub queue_policy: QueuePolicy,
    pub orchestration_policy: OrchestrationPolicy,
    pub max_concurrent_runs: usize,
    pub max_runs_per_workspace: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from("runs"),
            scope: ScopeLock::default(),
            verification: VerificationConfig::default(),
            workers: BTreeMap::new(),
            phases: PhaseWorkers::default(),
            resilience: ResilienceConfig::default(),
            receipts: ReceiptsConfig::default(),
            workflow: WorkflowConfig::default(),
            max_run_wall_minutes: 120,
            max_ticks: 50,
            stall_threshold_minutes: 15,
            max_milestone_retries: 3,
            allow_deps_flag: false,
            queue_policy: QueuePolicy::Fifo,
            orchestration_policy: OrchestrationPolicy::Serialize,
            max_concurrent_runs: 3,
            max_runs_per_workspace: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_list(value: &str) -> Vec<String> {
        value
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    /// Apply a single `key = value` line. Keys are dotted
    /// (`scope.allowlist`), optionally with a bracketed worker name
    /// segment (`workers.claude.bin`). List-valued keys repeat the key
    /// across multiple lines and accumulate.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        let segments: Vec<&str> = key.split('.').collect();
        match segments.as_slice() {
            ["runs_root"] => self.runs_root = PathBuf::from(value),
            ["max_run_wall_minutes"] => {
                self.max_run_wall_minutes = Self::parse_int(key, value)?;
            }
            ["max_ticks"] => self.max_ticks = Self::parse_int(key, value)?,
            ["stall_threshold_minutes"] => {
                self.stall_threshold_minutes = Self::parse_int(key, value)?;
            }
            ["max_milestone_retries"] => {
                self.max_milestone_retries = Self::parse_int(key, value)?;
            }
            ["allow_deps_flag"] => {
                self.allow_deps_flag = Self::parse_bool(key, value)?;
            }
            ["max_concurrent_runs"] => {
                self.max_concurrent_runs = Self::parse_int(key, value)?;
            }
            ["max_runs_per_workspace"] => {
                self.max_runs_per_workspace = Some(Self::parse_int(key, value)?);
            }
            ["queue_policy"] => {
                self.queue_policy = match value {
                    "fifo" => QueuePolicy::Fifo,
                    "newest_first" => QueuePolicy::NewestFirst,
                    _ => return Err(ConfigError::InvalidLine(format!("bad queue_policy: {value}"))),
                };
            }
            ["orchestration_policy"] => {
                self.orchestration_policy = match value {
                    "serialize" => OrchestrationPolicy::Serialize,
                    "force" => OrchestrationPolicy::Force,
                    "fail" => OrchestrationPolicy::Fail,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "bad orchestration_policy: {value}"
                        )))
                    }
                };
            }

            ["scope", "allowlist"] => self.scope.allowlist.extend(Self::parse_list(value)),
            ["scope", "denylist"] => self.scope.denylist.extend(Self::parse_list(value)),
            ["scope", "lockfiles"] => self.scope.lockfiles.extend(Self::parse_list(value)),
            ["scope", "env_allowlist"] => {
                self.scope.env_allowlist.extend(Self::parse_list(value));
            }

            ["verification", "tier0"] => self.verification.tier0.extend(Self::parse_list(value)),
            ["verification", "tier1"] => self.verification.tier1.extend(Self::parse_list(value)),
            ["verification", "tier2"] => self.verification.tier2.extend(Self::parse_list(value)),
            ["verification", "risk_triggers"] => {
                self.verification.risk_triggers.extend(Self::parse_list(value));
            }
            ["verification", "max_verify_time_per_milestone"] => {
                self.verification.max_verify_time_per_milestone = Self::parse_int(key, value)?;
            }
            ["verification", "cwd"] => self.verification.cwd = Some(PathBuf::from(value)),

            ["workers", name, "bin"] => {
                self.workers.entry((*name).to_string()).or_default().bin = PathBuf::from(value);
            }
            ["workers", name, "args"] => {
                self.workers
                    .entry((*name).to_string())
                    .or_default()
                    .args
                    .extend(Self::parse_list(value));
            }
            ["workers", name, "output"] => {
                let output = match value {
                    "text" => WorkerOutput::Text,
                    "json" => WorkerOutput::Json,
                    "jsonl" => WorkerOutput::Jsonl,
                    _ => return Err(ConfigError::InvalidLine(format!("bad worker output: {value}"))),
                };
                self.workers.entry((*name).to_string()).or_default().output = output;
            }

            ["phases", "plan"] => self.phases.plan = value.to_string(),
            ["phases", "implement"] => self.phases.implement = value.to_string(),
            ["phases", "review"] => self.phases.review = value.to_string(),

            ["resilience", "auto_resume"] => {
                self.resilience.auto_resume = Self::parse_bool(key, value)?;
            }
            ["resilience", "max_auto_resumes"] => {
                self.resilience.max_auto_resumes = Self::parse_int(key, value)?;
            }
            ["resilience", "max_worker_call_minutes"] => {
                self.resilience.max_worker_call_minutes = Self::parse_int(key, value)?;
            }
            ["resilience", "max_review_rounds"] => {
                self.resilience.max_review_rounds = Self::parse_int(key, value)?;
            }
            ["resilience", "auto_resume_delays_ms"] => {
                self.resilience.auto_resume_delays_ms = value
                    .split_whitespace()
                    .map(|v| Self::parse_int::<u64>(key, v))
                    .collect::<Result<Vec<_>>>()?;
            }

            ["receipts", "redact"] => self.receipts.redact = Self::parse_bool(key, value)?,
            ["receipts", "capture_cmd_output"] => {
                self.receipts.capture_cmd_output = match value {
                    "full" => CaptureMode::Full,
                    "truncated" => CaptureMode::Truncated,
                    "metadata_only" => CaptureMode::MetadataOnly,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "bad capture_cmd_output: {value}"
                        )))
                    }
                };
            }
            ["receipts", "max_output_bytes"] => {
                self.receipts.max_output_bytes = Self::parse_int(key, value)?;
            }

            ["workflow", "mode"] => self.workflow.mode = value.to_string(),
            ["workflow", "integration_branch"] => {
                self.workflow.integration_branch = value.to_string();
            }
            ["workflow", "release_branch"] => {
                self.workflow.release_branch = Some(value.to_string());
            }
            ["workflow", "submit_strategy"] => self.workflow.submit_strategy = value.to_string(),
            ["workflow", "protected_branches"] => {
                self.workflow.protected_branches.extend(Self::parse_list(value));
            }
            ["workflow", "require_clean_tree"] => {
                self.workflow.require_clean_tree = Self::parse_bool(key, value)?;
            }
            ["workflow", "require_verification"] => {
                self.workflow.require_verification = Self::parse_bool(key, value)?;
            }

            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Resolve the worker bound to a phase role via `phases.<role>`,
    /// looked up in `workers` by name.
    pub fn worker_for(&self, role: crate::types::WorkerRole) -> Option<&WorkerConfig> {
        let name = match role {
            crate::types::WorkerRole::Plan => &self.phases.plan,
            crate::types::WorkerRole::Implement => &self.phases.implement,
            crate::types::WorkerRole::Review => &self.phases.review,
        };
        self.workers.get(name)
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.runs_root.is_relative() {
            self.runs_root = workspace_root.join(&self.runs_root);
        }
        if let Some(cwd) = &self.verification.cwd {
            if cwd.is_relative() {
                self.verification.cwd = Some(workspace_root.join(cwd));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_caps() {
        let config = Config::default();
        assert_eq!(config.max_run_wall_minutes, 120);
        assert_eq!(config.max_ticks, 50);
        assert_eq!(config.max_milestone_retries, 3);
        assert_eq!(config.resilience.max_worker_call_minutes, 45);
        assert_eq!(config.resilience.max_review_rounds, 2);
    }

    #[test]
    fn parses_scope_section_with_repeated_keys() {
        let mut config = Config::default();
        config
            .parse_content("scope.allowlist = src/**\nscope.allowlist = tests/**\nscope.denylist = secrets/**\n")
            .unwrap();
        assert_eq!(config.scope.allowlist, vec!["src/**", "tests/**"]);
        assert_eq!(config.scope.denylist, vec!["secrets/**"]);
    }

    #[test]
    fn parses_worker_sections_by_name() {
        let mut config = Config::default();
        config
            .parse_content(
                "workers.claude.bin = claude\nworkers.claude.args = -p --dangerously-skip-permissions\nworkers.claude.output = jsonl\nphases.plan = claude\n",
            )
            .unwrap();
        let worker = &config.workers["claude"];
        assert_eq!(worker.bin, PathBuf::from("claude"));
        assert_eq!(worker.args, vec!["-p", "--dangerously-skip-permissions"]);
        assert_eq!(worker.output, WorkerOutput::Jsonl);
        assert_eq!(config.phases.plan, "claude");
    }

    #[test]
    fn parses_verification_section() {
        let mut config = Config::default();
        config
            .parse_content(
                "verification.tier0 = cargo build\nverification.tier1 = cargo test\nverification.risk_triggers = migrations/**\nverification.max_verify_time_per_milestone = 300\n",
            )
            .unwrap();
        assert_eq!(config.verification.tier0, vec!["cargo build"]);
        assert_eq!(config.verification.tier1, vec!["cargo test"]);
        assert_eq!(config.verification.max_verify_time_per_milestone, 300);
    }

    #[test]
    fn parses_resilience_and_receipts_sections() {
        let mut config = Config::default();
        config
            .parse_content(
                "resilience.auto_resume = true\nresilience.max_auto_resumes = 2\nreceipts.capture_cmd_output = full\nreceipts.max_output_bytes = 1024\n",
            )
            .unwrap();
        assert!(config.resilience.auto_resume);
        assert_eq!(config.resilience.max_auto_resumes, 2);
        assert_eq!(config.receipts.capture_cmd_output, CaptureMode::Full);
        assert_eq!(config.receipts.max_output_bytes, 1024);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("bogus_key = 1\n"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("resilience.auto_resume = maybe\n"),
            Err(ConfigError::InvalidBool { .. })
        ));
    }

    #[test]
    fn worker_for_resolves_phase_to_named_worker() {
        let mut config = Config::default();
        config
            .parse_content("workers.claude.bin = claude\nphases.plan = claude\n")
            .unwrap();
        let worker = config.worker_for(crate::types::WorkerRole::Plan).unwrap();
        assert_eq!(worker.bin, PathBuf::from("claude"));
        assert!(config.worker_for(crate::types::WorkerRole::Review).is_none());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }
}
