//! SDK adapter: routes to native provider clients by provider name.
//!
//! Concrete vendor bindings live outside the core. They plug in by
//! implementing [`ProviderClient`] and registering under a provider name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::CapabilityAdapter;
use crate::domain::{AdapterOutput, AgentConfig, DispatchError, IntegrationType};

/// One completion call, as seen by a provider client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
}

/// Native client for one provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<AdapterOutput, DispatchError>;
}

#[derive(Default)]
pub struct SdkAdapter {
    clients: RwLock<HashMap<String, Arc<dyn ProviderClient>>>,
}

impl SdkAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for `provider`. Lookup is case-insensitive.
    pub fn register_client(&self, provider: &str, client: Arc<dyn ProviderClient>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.to_ascii_lowercase(), client);
    }

    pub fn with_client(self, provider: &str, client: Arc<dyn ProviderClient>) -> Self {
        self.register_client(provider, client);
        self
    }

    fn client(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider.to_ascii_lowercase())
            .cloned()
    }
}

#[async_trait]
impl CapabilityAdapter for SdkAdapter {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Sdk
    }

    async fn invoke(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AdapterOutput, DispatchError> {
        let client = self
            .client(&agent.provider)
            .ok_or_else(|| DispatchError::UnknownProvider(agent.provider.clone()))?;

        let request = CompletionRequest {
            model: agent.model_name.clone(),
            system_prompt: agent.system_prompt.clone(),
            prompt: prompt.to_string(),
        };

        tokio::time::timeout(timeout, client.complete(request))
            .await
            .map_err(|_| DispatchError::Timeout)?
    }
}
