//! Capability adapters.
//!
//! The dispatcher reaches every agent through [`CapabilityAdapter`], keyed by
//! the agent's [`IntegrationType`]. Adapters report failures as
//! [`DispatchError`] values; they never panic on bad input.

pub mod cli;
pub mod http;
pub mod sdk;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{AdapterOutput, AgentConfig, DispatchError, IntegrationType};

pub use cli::CliAdapter;
pub use http::HttpAdapter;
pub use sdk::{CompletionRequest, ProviderClient, SdkAdapter};

/// Invoke one agent with one prompt.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn integration_type(&self) -> IntegrationType;

    /// `timeout` is the time this call may take; implementations should stop
    /// work and return [`DispatchError::Timeout`] once it elapses.
    async fn invoke(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AdapterOutput, DispatchError>;
}

/// Adapters keyed by integration type.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<IntegrationType, Arc<dyn CapabilityAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// CLI and HTTP adapters plus an SDK adapter with no provider clients.
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(CliAdapter::new()))
            .with(Arc::new(HttpAdapter::new()))
            .with(Arc::new(SdkAdapter::new()))
    }

    /// Add (or replace) the adapter for its integration type.
    pub fn with(mut self, adapter: Arc<dyn CapabilityAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.insert(adapter.integration_type(), adapter);
    }

    pub fn get(&self, integration_type: IntegrationType) -> Option<Arc<dyn CapabilityAdapter>> {
        self.adapters.get(&integration_type).cloned()
    }

    pub fn contains(&self, integration_type: IntegrationType) -> bool {
        self.adapters.contains_key(&integration_type)
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterSet").field("adapters", &kinds).finish()
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, for error details.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
