use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use weave_core::error::{Result, WeaveError};
use weave_core::traits::Agent;

/// Registry of named agents.
///
/// Populated mutably during initialization, then shared immutably behind an
/// `Arc` for concurrent lookups while workflows run.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Fails if the name is blank or already taken.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = checked_name(agent.as_ref())?;
        if self.agents.contains_key(&name) {
            return Err(WeaveError::DuplicateRegistration(name));
        }
        info!(agent = %name, "Registered agent");
        self.agents.insert(name, agent);
        Ok(())
    }

    /// Register an agent, replacing any existing one with the same name.
    /// Returns the replaced agent.
    pub fn register_or_replace(&mut self, agent: Arc<dyn Agent>) -> Result<Option<Arc<dyn Agent>>> {
        let name = checked_name(agent.as_ref())?;
        let previous = self.agents.insert(name.clone(), agent);
        if previous.is_some() {
            info!(agent = %name, "Replaced registered agent");
        } else {
            info!(agent = %name, "Registered agent");
        }
        Ok(previous)
    }

    /// Unregister an agent by name.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Agent>> {
        let removed = self.agents.remove(name);
        if removed.is_some() {
            debug!(agent = %name, "Unregistered agent");
        }
        removed
    }

    /// Look up an agent by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// `(name, description)` pairs in name order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.agents
            .iter()
            .map(|(name, agent)| (name.as_str(), agent.description()))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// The registry key is the agent's own name, so it must already be trimmed.
fn checked_name(agent: &dyn Agent) -> Result<String> {
    let name = agent.name();
    if name.trim().is_empty() {
        return Err(WeaveError::InvalidAgent("agent has no name".into()));
    }
    if name.trim() != name {
        return Err(WeaveError::InvalidAgent(format!(
            "agent name '{}' has surrounding whitespace",
            name
        )));
    }
    Ok(name.to_string())
}
