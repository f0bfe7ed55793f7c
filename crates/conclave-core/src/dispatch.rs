//! Concurrent prompt fan-out.
//!
//! [`PromptDispatcher::dispatch`] sends one prompt to a set of agents, each on
//! its own task, and joins them under a shared deadline. The join keeps every
//! response that completed; agents still in flight when the deadline passes
//! are aborted and reported with `error = "deadline exceeded"`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::adapter::AdapterSet;
use crate::domain::{AgentConfig, AgentResponse, DispatchError, Result};
use crate::metrics::METRICS;
use crate::registry::AgentRegistry;

/// Used when an agent has no `timeout_ms` of its own.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack allowed past the batch deadline for tasks to observe their own
/// timeouts before they are aborted.
const JOIN_GRACE: Duration = Duration::from_millis(50);

pub struct PromptDispatcher {
    registry: Arc<AgentRegistry>,
    adapters: AdapterSet,
    default_timeout: Duration,
}

impl PromptDispatcher {
    pub fn new(registry: Arc<AgentRegistry>, adapters: AdapterSet) -> Self {
        Self {
            registry,
            adapters,
            default_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Dispatch `prompt` to `agents` (all registered agents when `None`)
    /// and wait at most `deadline` for the batch.
    pub async fn dispatch(
        &self,
        prompt: &str,
        agents: Option<&[String]>,
        deadline: Duration,
    ) -> Result<Vec<AgentResponse>> {
        self.dispatch_until(prompt, agents, Instant::now() + deadline)
            .await
    }

    /// Like [`dispatch`](Self::dispatch) with an absolute deadline.
    ///
    /// Returns one response per requested agent, in request order. Unknown
    /// agent names fail the whole call before anything is sent.
    #[instrument(skip(self, prompt, agents), fields(prompt_len = prompt.len()))]
    pub async fn dispatch_until(
        &self,
        prompt: &str,
        agents: Option<&[String]>,
        deadline: Instant,
    ) -> Result<Vec<AgentResponse>> {
        let names = match agents {
            Some(names) => names.to_vec(),
            None => self.registry.names(),
        };
        let configs = names
            .iter()
            .map(|name| self.registry.get(name))
            .collect::<Result<Vec<AgentConfig>>>()?;

        if configs.is_empty() {
            return Ok(Vec::new());
        }

        let batch_started = Utc::now();
        let batch_clock = Instant::now();
        let prompt: Arc<str> = Arc::from(prompt);

        let mut aborts = Vec::with_capacity(configs.len());
        let mut pending = FuturesUnordered::new();

        for (index, config) in configs.iter().enumerate() {
            METRICS.inc_dispatches();
            let agent_timeout = config.timeout().unwrap_or(self.default_timeout);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let capped_by_deadline = remaining <= agent_timeout;
            let budget = agent_timeout.min(remaining);

            let adapter = self.adapters.get(config.integration_type);
            let config = config.clone();
            let prompt = Arc::clone(&prompt);

            let handle = tokio::spawn(async move {
                let started_at = Utc::now();
                let clock = Instant::now();
                let result = match adapter {
                    None => Err(DispatchError::NoAdapter(
                        config.integration_type.to_string(),
                    )),
                    Some(adapter) => {
                        match tokio::time::timeout(budget, adapter.invoke(&config, &prompt, budget))
                            .await
                        {
                            Ok(Err(DispatchError::Timeout)) | Err(_) if capped_by_deadline => {
                                Err(DispatchError::DeadlineExceeded)
                            }
                            Ok(result) => result,
                            Err(_) => Err(DispatchError::Timeout),
                        }
                    }
                };
                AgentResponse::from_result(&config, result, started_at, clock.elapsed())
            });

            aborts.push(handle.abort_handle());
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<AgentResponse>> = vec![None; configs.len()];
        loop {
            match tokio::time::timeout_at(deadline + JOIN_GRACE, pending.next()).await {
                Ok(Some((index, Ok(response)))) => slots[index] = Some(response),
                Ok(Some((index, Err(join_err)))) => {
                    warn!(agent = %configs[index].name, "agent task did not complete cleanly");
                    slots[index] = Some(AgentResponse::failed(
                        &configs[index],
                        join_error(join_err),
                        batch_started,
                        batch_clock.elapsed(),
                    ));
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("dispatch deadline passed; abandoning in-flight agents");
                    aborts.iter().for_each(|a| a.abort());
                    break;
                }
            }
        }

        let responses: Vec<AgentResponse> = slots
            .into_iter()
            .zip(&configs)
            .map(|(slot, config)| {
                slot.unwrap_or_else(|| {
                    AgentResponse::failed(
                        config,
                        DispatchError::DeadlineExceeded,
                        batch_started,
                        batch_clock.elapsed(),
                    )
                })
            })
            .collect();

        let failed = responses.iter().filter(|r| !r.is_success()).count();
        for response in responses.iter().filter(|r| !r.is_success()) {
            METRICS.inc_agent_failures();
            debug!(
                agent = %response.agent_name,
                error = response.error.as_deref().unwrap_or_default(),
                "agent failed"
            );
        }
        debug!(
            agents = responses.len(),
            failed,
            elapsed_ms = batch_clock.elapsed().as_millis() as u64,
            "dispatch batch joined"
        );
        Ok(responses)
    }
}

fn join_error(err: JoinError) -> DispatchError {
    if err.is_cancelled() {
        return DispatchError::DeadlineExceeded;
    }
    DispatchError::Panicked(panic_message(err.into_panic().as_ref()))
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
