//! Scripted stand-ins for agents and run owners.
//!
//! `ScriptedAdapter` answers each agent from a per-agent queue of scripted
//! steps, falling back to a sticky default. It records every call so tests
//! can assert on who was asked what.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::CapabilityAdapter;
use crate::domain::{AdapterOutput, AgentConfig, AgentRun, DispatchError, IntegrationType, TokenMetrics};
use crate::runner::RunOwner;

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// One scripted reaction to an invocation.
#[derive(Clone)]
pub enum Script {
    Reply(String),
    /// Reply computed from the prompt.
    Respond(Responder),
    Fail(DispatchError),
    /// Sleep, then behave like the inner script.
    Delay(Duration, Box<Script>),
    Panic(String),
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Script::Reply(text) => f.debug_tuple("Reply").field(text).finish(),
            Script::Respond(_) => f.write_str("Respond(..)"),
            Script::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
            Script::Delay(d, inner) => f.debug_tuple("Delay").field(d).field(inner).finish(),
            Script::Panic(msg) => f.debug_tuple("Panic").field(msg).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub agent: String,
    pub prompt: String,
}

#[derive(Default)]
struct ScriptState {
    queued: HashMap<String, VecDeque<Script>>,
    defaults: HashMap<String, Script>,
    calls: Vec<RecordedCall>,
}

pub struct ScriptedAdapter {
    integration_type: IntegrationType,
    usage: TokenMetrics,
    state: Mutex<ScriptState>,
}

impl ScriptedAdapter {
    pub fn new(integration_type: IntegrationType) -> Self {
        Self {
            integration_type,
            usage: TokenMetrics::default(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Usage reported with every successful reply.
    pub fn with_usage(mut self, usage: TokenMetrics) -> Self {
        self.usage = usage;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behavior for `agent` whenever its queue is empty.
    pub fn set_default(&self, agent: &str, script: Script) -> &Self {
        self.state().defaults.insert(agent.to_string(), script);
        self
    }

    /// Behavior for the next call to `agent`, ahead of the default.
    pub fn push(&self, agent: &str, script: Script) -> &Self {
        self.state()
            .queued
            .entry(agent.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn reply(&self, agent: &str, text: impl Into<String>) -> &Self {
        self.set_default(agent, Script::Reply(text.into()))
    }

    pub fn respond_with<F>(&self, agent: &str, responder: F) -> &Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.set_default(agent, Script::Respond(Arc::new(responder)))
    }

    pub fn fail(&self, agent: &str, error: DispatchError) -> &Self {
        self.set_default(agent, Script::Fail(error))
    }

    pub fn delay(&self, agent: &str, delay: Duration, text: impl Into<String>) -> &Self {
        self.set_default(agent, Script::Delay(delay, Box::new(Script::Reply(text.into()))))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.state().calls.iter().filter(|c| c.agent == agent).count()
    }

    fn next_script(&self, agent: &str, prompt: &str) -> Option<Script> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            agent: agent.to_string(),
            prompt: prompt.to_string(),
        });
        let queued = state.queued.get_mut(agent).and_then(VecDeque::pop_front);
        queued.or_else(|| state.defaults.get(agent).cloned())
    }
}

#[async_trait]
impl CapabilityAdapter for ScriptedAdapter {
    fn integration_type(&self) -> IntegrationType {
        self.integration_type
    }

    async fn invoke(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<AdapterOutput, DispatchError> {
        let mut script = self.next_script(&agent.name, prompt).ok_or_else(|| {
            DispatchError::Provider(format!("no script for agent {}", agent.name))
        })?;
        loop {
            match script {
                Script::Reply(text) => return Ok(AdapterOutput::text(text).with_usage(self.usage)),
                Script::Respond(responder) => {
                    return Ok(AdapterOutput::text(responder(prompt)).with_usage(self.usage))
                }
                Script::Fail(err) => return Err(err),
                Script::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    script = *inner;
                }
                Script::Panic(msg) => panic!("{msg}"),
            }
        }
    }
}

/// Collects every run it is told about.
#[derive(Debug, Default)]
pub struct RecordingOwner {
    finished: Mutex<Vec<AgentRun>>,
}

impl RecordingOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> Vec<AgentRun> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RunOwner for RecordingOwner {
    async fn run_finished(&self, run: &AgentRun) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(run.clone());
    }
}
