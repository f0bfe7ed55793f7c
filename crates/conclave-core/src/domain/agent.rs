//! Agent configuration and per-dispatch responses.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_state::TokenMetrics;

use super::error::{ConclaveError, DispatchError, Result};

/// How an agent is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationType {
    Sdk,
    Cli,
    Http,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::Sdk => "sdk",
            IntegrationType::Cli => "cli",
            IntegrationType::Http => "http",
        }
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationType {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sdk" => Ok(IntegrationType::Sdk),
            "cli" => Ok(IntegrationType::Cli),
            "http" => Ok(IntegrationType::Http),
            other => Err(ConclaveError::Validation(format!(
                "unknown integration type: {other}"
            ))),
        }
    }
}

/// Validated description of how to reach one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique key within a registry.
    pub name: String,
    pub integration_type: IntegrationType,
    pub provider: String,
    pub model_name: String,
    /// Required for `http` agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Required for `cli` agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    fn base(name: &str, integration_type: IntegrationType, provider: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            integration_type,
            provider: provider.to_string(),
            model_name: model.to_string(),
            endpoint: None,
            command: None,
            args: Vec::new(),
            timeout_ms: None,
            system_prompt: None,
        }
    }

    /// An agent served by a native provider client.
    pub fn sdk(name: &str, provider: &str, model: &str) -> Self {
        Self::base(name, IntegrationType::Sdk, provider, model)
    }

    /// An agent reached by shelling out to `command`.
    pub fn cli(name: &str, provider: &str, model: &str, command: &str) -> Self {
        let mut config = Self::base(name, IntegrationType::Cli, provider, model);
        config.command = Some(command.to_string());
        config
    }

    /// An agent reached by a JSON POST to `endpoint`.
    pub fn http(name: &str, provider: &str, model: &str, endpoint: &str) -> Self {
        let mut config = Self::base(name, IntegrationType::Http, provider, model);
        config.endpoint = Some(endpoint.to_string());
        config
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Per-agent timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Check the fields required for this agent's integration type.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ConclaveError::Validation(format!(
                "agent '{}': {msg}",
                self.name
            )))
        };

        if self.name.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "agent name cannot be empty".to_string(),
            ));
        }
        if self.provider.trim().is_empty() {
            return invalid("provider cannot be empty");
        }
        if self.model_name.trim().is_empty() {
            return invalid("model_name cannot be empty");
        }
        if self.timeout_ms == Some(0) {
            return invalid("timeout_ms must be positive");
        }

        match self.integration_type {
            IntegrationType::Http => match self.endpoint.as_deref().map(str::trim) {
                Some(endpoint) if !endpoint.is_empty() => {
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                        return invalid("endpoint must be an http(s) URL");
                    }
                }
                _ => return invalid("http agents require an endpoint"),
            },
            IntegrationType::Cli => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return invalid("cli agents require a command");
                }
            }
            IntegrationType::Sdk => {}
        }
        Ok(())
    }
}

/// A tool invocation reported by an agent, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// What a capability adapter returns on success.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdapterOutput {
    pub output: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenMetrics,
}

impl AdapterOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenMetrics) -> Self {
        self.usage = usage;
        self
    }
}

/// Result of dispatching one prompt to one agent. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_name: String,
    pub provider: String,
    pub model_name: String,
    pub output: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenMetrics,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl AgentResponse {
    /// Build a response from an adapter result.
    pub fn from_result(
        agent: &AgentConfig,
        result: std::result::Result<AdapterOutput, DispatchError>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let (output, error) = match result {
            Ok(out) => (out, None),
            Err(err) => (AdapterOutput::default(), Some(err.to_string())),
        };
        Self {
            agent_name: agent.name.clone(),
            provider: agent.provider.clone(),
            model_name: agent.model_name.clone(),
            output: output.output,
            tool_calls: output.tool_calls,
            usage: output.usage,
            error,
            duration_ms: duration.as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// A failed response for an agent that never produced a result.
    pub fn failed(
        agent: &AgentConfig,
        error: DispatchError,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self::from_result(agent, Err(error), started_at, duration)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
