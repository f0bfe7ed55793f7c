//! HTTP adapter: JSON POST to an agent endpoint.
//!
//! Request body:
//! ```json
//! {"agent": "...", "model": "...", "prompt": "...", "system_prompt": "..."}
//! ```
//! The response may be JSON (`output`, `text` or `content` field, plus
//! optional `tool_calls` and `usage`) or plain text, which is taken verbatim.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use conclave_state::TokenMetrics;

use super::{truncate, CapabilityAdapter};
use crate::domain::{AdapterOutput, AgentConfig, DispatchError, IntegrationType, ToolCall};

const BODY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    agent: &'a str,
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cost_micros: u64,
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(alias = "text", alias = "content")]
    output: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl From<AgentReply> for AdapterOutput {
    fn from(reply: AgentReply) -> Self {
        let usage = reply.usage.unwrap_or_default();
        AdapterOutput {
            output: reply.output,
            tool_calls: reply.tool_calls,
            usage: TokenMetrics::new(
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.cost_micros,
            ),
        }
    }
}

/// HTTP client for agents exposed behind a JSON endpoint.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("conclave/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn parse_body(body: &str) -> Result<AdapterOutput, DispatchError> {
        let trimmed = body.trim();
        if trimmed.starts_with('{') {
            let reply: AgentReply = serde_json::from_str(trimmed)
                .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;
            return Ok(reply.into());
        }
        Ok(AdapterOutput::text(trimmed))
    }
}

#[async_trait]
impl CapabilityAdapter for HttpAdapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Http
    }

    async fn invoke(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AdapterOutput, DispatchError> {
        let endpoint = agent
            .endpoint
            .as_deref()
            .ok_or_else(|| DispatchError::Http(format!("agent '{}' has no endpoint", agent.name)))?;

        let request = AgentRequest {
            agent: &agent.name,
            model: &agent.model_name,
            prompt,
            system_prompt: agent.system_prompt.as_deref(),
        };

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                DispatchError::Timeout
            } else {
                DispatchError::Http(e.to_string())
            }
        };

        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        let body = response.text().await.map_err(map_err)?;
        debug!(agent = %agent.name, status = status.as_u16(), "http agent replied");

        if !status.is_success() {
            return Err(DispatchError::HttpStatus {
                status: status.as_u16(),
                body: truncate(&body, BODY_LIMIT),
            });
        }
        Self::parse_body(&body)
    }
}
