//! CLI adapter: shells out to an agent binary.
//!
//! The prompt is written to the child's stdin unless one of the configured
//! args contains the `{prompt}` placeholder, in which case it is substituted
//! there instead. Stdout becomes the agent output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{truncate, CapabilityAdapter};
use crate::domain::{AdapterOutput, AgentConfig, DispatchError, IntegrationType};

const PROMPT_PLACEHOLDER: &str = "{prompt}";
const STDERR_LIMIT: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct CliAdapter;

impl CliAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CapabilityAdapter for CliAdapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Cli
    }

    async fn invoke(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AdapterOutput, DispatchError> {
        let command = agent
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DispatchError::Spawn {
                command: String::new(),
                reason: format!("agent '{}' has no command configured", agent.name),
            })?;

        let inline_prompt = agent.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER));
        let args: Vec<String> = agent
            .args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect();

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .env("CONCLAVE_AGENT", &agent.name)
            .env("CONCLAVE_MODEL", &agent.model_name)
            .stdin(if inline_prompt {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(system_prompt) = &agent.system_prompt {
            cmd.env("CONCLAVE_SYSTEM_PROMPT", system_prompt);
        }

        let mut child = cmd.spawn().map_err(|e| DispatchError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = prompt.to_string();
            // Written from a separate task so a chatty child cannot deadlock
            // on a full stdout pipe while we are still writing.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "agent closed stdin early");
                }
            });
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DispatchError::Timeout)?
            .map_err(|e| DispatchError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DispatchError::NonZeroExit {
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(&String::from_utf8_lossy(&output.stderr), STDERR_LIMIT),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!(agent = %agent.name, bytes = stdout.len(), "cli agent finished");
        Ok(AdapterOutput::text(stdout))
    }
}
