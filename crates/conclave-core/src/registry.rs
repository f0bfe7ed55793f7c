//! Agent registry.
//!
//! An explicit context object (not a process global) holding validated
//! [`AgentConfig`]s keyed by name. Reads are cheap and concurrent; the
//! registry hands out clones so registered configs are never mutated in place.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::domain::{AgentConfig, ConclaveError, IntegrationType, Result};

/// Optional filter for [`AgentRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFilter {
    pub integration_type: Option<IntegrationType>,
    pub provider: Option<String>,
}

impl AgentFilter {
    pub fn integration_type(integration_type: IntegrationType) -> Self {
        Self {
            integration_type: Some(integration_type),
            provider: None,
        }
    }

    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            integration_type: None,
            provider: Some(provider.into()),
        }
    }

    fn matches(&self, config: &AgentConfig) -> bool {
        self.integration_type
            .map_or(true, |t| t == config.integration_type)
            && self
                .provider
                .as_deref()
                .map_or(true, |p| p.eq_ignore_ascii_case(&config.provider))
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentConfig>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register an agent. Rejects invalid configs and name collisions.
    pub fn register(&self, config: AgentConfig) -> Result<()> {
        config.validate()?;
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(&config.name) {
            return Err(ConclaveError::Validation(format!(
                "agent '{}' is already registered",
                config.name
            )));
        }
        debug!(agent = %config.name, integration = %config.integration_type, "agent registered");
        agents.insert(config.name.clone(), config);
        Ok(())
    }

    /// Register several agents, stopping at the first rejected one.
    pub fn register_all(&self, configs: impl IntoIterator<Item = AgentConfig>) -> Result<()> {
        configs.into_iter().try_for_each(|c| self.register(c))
    }

    pub fn get(&self, name: &str) -> Result<AgentConfig> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("agent", name))
    }

    /// All agents sorted by name, optionally filtered.
    pub fn list(&self, filter: Option<&AgentFilter>) -> Vec<AgentConfig> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| filter.map_or(true, |f| f.matches(c)))
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registered agent.
    pub fn clear(&self) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
