//! Engine configuration.
//!
//! Loaded from TOML, then overridden from `CONCLAVE_*` environment
//! variables, then validated. Every section is optional.
//!
//! ```toml
//! max_checkpoints = 20
//! run_timeout_ms = 900000
//! worker_concurrency = 4
//!
//! [[agents]]
//! name = "claude"
//! integration_type = "cli"
//! provider = "anthropic"
//! model_name = "claude-sonnet"
//! command = "claude"
//! args = ["-p", "{prompt}"]
//! timeout_ms = 120000
//!
//! [[agents]]
//! name = "gateway"
//! integration_type = "http"
//! provider = "openai"
//! model_name = "gpt-4o"
//! endpoint = "http://localhost:8080/v1/complete"
//!
//! [phases.coding]
//! agents = ["claude", "gateway"]
//! dispatch_timeout_ms = 300000
//!
//! [judge]
//! default_provider = "anthropic"
//!
//! [retry]
//! max_retries = 2
//! feedback_attempts = 3
//!
//! [verification]
//! success_marker = "VERIFICATION PASSED"
//! failure_marker = "VERIFICATION FAILED"
//!
//! [[evaluation.commands]]
//! name = "rustfmt"
//! program = "rustfmt"
//! args = ["--check", "{file}"]
//! phases = ["coding"]
//!
//! [telemetry]
//! jsonl_path = ".conclave/events.jsonl"
//!
//! [storage]
//! backend = "surreal"
//! url = "surrealkv://.conclave/db"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::DEFAULT_MAX_CHECKPOINTS;
use crate::domain::{AgentConfig, ConclaveError, Phase, Result};
use crate::judge::JudgeConfig;
use crate::runner::{
    PhaseSettings, RunnerPolicy, DEFAULT_FAILURE_MARKER, DEFAULT_FEEDBACK_ATTEMPTS,
    DEFAULT_MAX_RETRIES, DEFAULT_PHASE_TIMEOUT, DEFAULT_SUCCESS_MARKER,
};

fn default_max_checkpoints() -> usize {
    DEFAULT_MAX_CHECKPOINTS
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_agent_timeout_ms() -> u64 {
    60_000
}

fn default_phase_timeout_ms() -> u64 {
    DEFAULT_PHASE_TIMEOUT.as_millis() as u64
}

fn default_judge_timeout_ms() -> u64 {
    120_000
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_feedback_attempts() -> usize {
    DEFAULT_FEEDBACK_ATTEMPTS
}

fn default_success_marker() -> String {
    DEFAULT_SUCCESS_MARKER.to_string()
}

fn default_failure_marker() -> String {
    DEFAULT_FAILURE_MARKER.to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_storage_url() -> String {
    "mem://".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub phases: PhasesConfig,
    #[serde(default)]
    pub judge: JudgeSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// Wall-clock budget for a whole run. Unset means no limit.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    /// Per-agent timeout for agents without their own `timeout_ms`.
    #[serde(default = "default_agent_timeout_ms")]
    pub default_agent_timeout_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            phases: PhasesConfig::default(),
            judge: JudgeSection::default(),
            retry: RetryConfig::default(),
            verification: VerificationConfig::default(),
            evaluation: EvaluationConfig::default(),
            telemetry: TelemetryConfig::default(),
            storage: StorageConfig::default(),
            max_checkpoints: default_max_checkpoints(),
            run_timeout_ms: None,
            default_agent_timeout_ms: default_agent_timeout_ms(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasesConfig {
    #[serde(default)]
    pub planning: Option<PhaseConfig>,
    #[serde(default)]
    pub coding: Option<PhaseConfig>,
    #[serde(default)]
    pub verification: Option<PhaseConfig>,
}

impl PhasesConfig {
    pub fn get(&self, phase: Phase) -> Option<&PhaseConfig> {
        match phase {
            Phase::Planning => self.planning.as_ref(),
            Phase::Coding => self.coding.as_ref(),
            Phase::Verification => self.verification.as_ref(),
        }
    }

    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseConfig {
        let slot = match phase {
            Phase::Planning => &mut self.planning,
            Phase::Coding => &mut self.coding,
            Phase::Verification => &mut self.verification,
        };
        slot.get_or_insert_with(PhaseConfig::default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, &PhaseConfig)> {
        Phase::ALL
            .into_iter()
            .filter_map(move |phase| self.get(phase).map(|p| (phase, p)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Empty means every registered agent.
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default = "default_phase_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            dispatch_timeout_ms: default_phase_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeSection {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default = "default_judge_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for JudgeSection {
    fn default() -> Self {
        Self {
            agent: None,
            default_provider: None,
            timeout_ms: default_judge_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_feedback_attempts")]
    pub feedback_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            feedback_attempts: default_feedback_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
    #[serde(default = "default_failure_marker")]
    pub failure_marker: String,
    #[serde(default)]
    pub require_success_marker: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            success_marker: default_success_marker(),
            failure_marker: default_failure_marker(),
            require_success_marker: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub llm_on_deterministic_failure: bool,
    #[serde(default)]
    pub commands: Vec<CommandEvaluatorConfig>,
    #[serde(default)]
    pub markers: Vec<MarkerEvaluatorConfig>,
    #[serde(default)]
    pub llm: Vec<LlmEvaluatorConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvaluatorConfig {
    pub name: String,
    pub program: String,
    /// `{file}` is replaced with the path of the candidate output file.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    /// File suffix for the candidate output, e.g. `.rs`.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Unset means every phase.
    #[serde(default)]
    pub phases: Option<Vec<Phase>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerEvaluatorConfig {
    pub name: String,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub forbid: Vec<String>,
    #[serde(default)]
    pub phases: Option<Vec<Phase>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmEvaluatorConfig {
    pub name: String,
    pub agent: String,
    pub criteria: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub phases: Option<Vec<Phase>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
    /// Re-emit telemetry events through `tracing`.
    #[serde(default)]
    pub tracing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Surreal,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "surreal" => Ok(StorageBackend::Surreal),
            other => Err(ConclaveError::Config(format!(
                "unknown storage backend '{other}'. Valid values: memory, surreal"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host:port`).
    #[serde(default = "default_storage_url")]
    pub url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: default_storage_url(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConclaveError::Config(format!("{key}={value}: {e}")))
}

impl EngineConfig {
    /// Read `path`, apply `CONCLAVE_*` overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConclaveError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without overrides or validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConclaveError::Config(format!("invalid config: {e}")))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Recognized: `CONCLAVE_MAX_RETRIES`, `CONCLAVE_MAX_CHECKPOINTS`,
    /// `CONCLAVE_RUN_TIMEOUT_MS`, `CONCLAVE_WORKER_CONCURRENCY`,
    /// `CONCLAVE_JUDGE_AGENT`, `CONCLAVE_JUDGE_PROVIDER`,
    /// `CONCLAVE_TELEMETRY_JSONL`, `CONCLAVE_STORAGE_BACKEND`,
    /// `CONCLAVE_STORAGE_URL`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("CONCLAVE_MAX_RETRIES") {
            self.retry.max_retries = parse_var("CONCLAVE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_MAX_CHECKPOINTS") {
            self.max_checkpoints = parse_var("CONCLAVE_MAX_CHECKPOINTS", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_RUN_TIMEOUT_MS") {
            self.run_timeout_ms = Some(parse_var("CONCLAVE_RUN_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("CONCLAVE_WORKER_CONCURRENCY") {
            self.worker_concurrency = parse_var("CONCLAVE_WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("CONCLAVE_JUDGE_AGENT") {
            self.judge.agent = Some(v);
        }
        if let Some(v) = lookup("CONCLAVE_JUDGE_PROVIDER") {
            self.judge.default_provider = Some(v);
        }
        if let Some(v) = lookup("CONCLAVE_TELEMETRY_JSONL") {
            self.telemetry.jsonl_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CONCLAVE_STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = lookup("CONCLAVE_STORAGE_URL") {
            self.storage.url = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !names.insert(agent.name.as_str()) {
                return Err(ConclaveError::Validation(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }

        let known = |name: &str, context: &str| -> Result<()> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(ConclaveError::Validation(format!(
                    "{context} references unknown agent '{name}'"
                )))
            }
        };
        for (phase, settings) in self.phases.iter() {
            for name in &settings.agents {
                known(name, &format!("phase {phase}"))?;
            }
            if settings.dispatch_timeout_ms == 0 {
                return Err(ConclaveError::Validation(format!(
                    "phase {phase}: dispatch_timeout_ms must be positive"
                )));
            }
        }
        if let Some(judge) = &self.judge.agent {
            known(judge, "judge")?;
        }
        for llm in &self.evaluation.llm {
            known(&llm.agent, &format!("evaluator {}", llm.name))?;
        }

        if self.max_checkpoints == 0 {
            return Err(ConclaveError::Validation(
                "max_checkpoints must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConclaveError::Validation(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        let v = &self.verification;
        if v.success_marker.trim().is_empty() || v.failure_marker.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "verification markers must not be empty".to_string(),
            ));
        }
        if v.success_marker == v.failure_marker {
            return Err(ConclaveError::Validation(
                "success and failure markers must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn runner_policy(&self) -> RunnerPolicy {
        RunnerPolicy {
            max_retries: self.retry.max_retries,
            feedback_attempts: self.retry.feedback_attempts,
            success_marker: self.verification.success_marker.clone(),
            failure_marker: self.verification.failure_marker.clone(),
            require_success_marker: self.verification.require_success_marker,
            evaluate_llm_on_deterministic_failure: self.evaluation.llm_on_deterministic_failure,
            run_timeout: self.run_timeout_ms.map(Duration::from_millis),
            phases: self
                .phases
                .iter()
                .map(|(phase, p)| {
                    (
                        phase,
                        PhaseSettings {
                            agents: p.agents.clone(),
                            dispatch_timeout: Duration::from_millis(p.dispatch_timeout_ms),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn judge_config(&self) -> JudgeConfig {
        JudgeConfig {
            agent: self.judge.agent.clone(),
            default_provider: self.judge.default_provider.clone(),
            timeout: Duration::from_millis(self.judge.timeout_ms),
        }
    }

    pub fn default_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.default_agent_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
max_checkpoints = 5

[[agents]]
name = "claude"
integration_type = "cli"
provider = "anthropic"
model_name = "sonnet"
command = "claude"
args = ["-p", "{prompt}"]

[[agents]]
name = "gateway"
integration_type = "http"
provider = "openai"
model_name = "gpt-4o"
endpoint = "http://localhost:8080/complete"

[phases.coding]
agents = ["claude", "gateway"]
dispatch_timeout_ms = 1000

[judge]
agent = "claude"

[[evaluation.markers]]
name = "no-todo"
forbid = ["todo!()"]
phases = ["coding"]
"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.max_checkpoints, 5);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.feedback_attempts, 3);
        assert_eq!(config.verification.failure_marker, "VERIFICATION FAILED");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(
            config.evaluation.markers[0].phases.as_deref(),
            Some(&[Phase::Coding][..])
        );

        let policy = config.runner_policy();
        assert_eq!(
            policy.phase(Phase::Coding).dispatch_timeout,
            Duration::from_secs(1)
        );
        assert!(policy.phase(Phase::Planning).agents.is_empty());
        assert_eq!(config.judge_config().agent.as_deref(), Some("claude"));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_phase_agent_rejected() {
        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config
            .phases
            .get_mut(Phase::Verification)
            .agents
            .push("ghost".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown agent 'ghost'"));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        let dup = config.agents[0].clone();
        config.agents.push(dup);
        assert!(matches!(config.validate(), Err(ConclaveError::Validation(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONCLAVE_MAX_RETRIES", "5"),
            ("CONCLAVE_RUN_TIMEOUT_MS", "1500"),
            ("CONCLAVE_JUDGE_PROVIDER", "openai"),
            ("CONCLAVE_STORAGE_BACKEND", "surreal"),
            ("CONCLAVE_STORAGE_URL", "ws://db:8000"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.run_timeout_ms, Some(1500));
        assert_eq!(config.judge.default_provider.as_deref(), Some("openai"));
        assert_eq!(config.storage.backend, StorageBackend::Surreal);
        assert_eq!(config.storage.url, "ws://db:8000");
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CONCLAVE_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }
}
