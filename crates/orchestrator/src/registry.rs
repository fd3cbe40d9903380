//! Explicit registry of the agents a process knows about.
//!
//! There is no global instance. Whoever wires the process creates one and
//! hands it to the components that need it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::{AgentRuntime, RuntimeHealth};
use crate::task::AgentId;

/// Anything that can report a [`RuntimeHealth`] snapshot.
pub trait HealthSource: Send + Sync {
    fn agent_id(&self) -> AgentId;

    fn task_types(&self) -> Vec<String>;

    fn health(&self) -> RuntimeHealth;
}

impl HealthSource for AgentRuntime {
    fn agent_id(&self) -> AgentId {
        AgentRuntime::agent_id(self).clone()
    }

    fn task_types(&self) -> Vec<String> {
        AgentRuntime::task_types(self)
    }

    fn health(&self) -> RuntimeHealth {
        AgentRuntime::health(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentRegistryError {
    #[error("agent '{0}' is already registered")]
    AlreadyRegistered(AgentId),
}

enum Registration {
    /// Runtime in this process, probed directly
    Local(Arc<dyn HealthSource>),
    /// Known only by the task types it announced
    Remote { task_types: Vec<String> },
}

struct RegisteredAgent {
    registration: Registration,
    registered_at: DateTime<Utc>,
}

impl RegisteredAgent {
    fn task_types(&self) -> Vec<String> {
        match &self.registration {
            Registration::Local(source) => source.task_types(),
            Registration::Remote { task_types } => task_types.clone(),
        }
    }
}

/// Health of every registered agent at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub agents: Vec<RuntimeHealth>,
    pub remote_agents: Vec<AgentId>,
    /// Every local runtime is live
    pub live: bool,
    /// Every local runtime accepts tasks
    pub ready: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<AgentId, RegisteredAgent>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn HealthSource>) -> Result<(), AgentRegistryError> {
        let agent_id = source.agent_id();
        let task_types = source.task_types();
        self.insert(agent_id.clone(), Registration::Local(source))?;
        info!(agent_id = %agent_id, task_types = ?task_types, "Agent registered");
        Ok(())
    }

    pub fn register_runtime(&self, runtime: &AgentRuntime) -> Result<(), AgentRegistryError> {
        self.register(Arc::new(runtime.clone()))
    }

    /// Record an agent living in another process. Replaces any earlier
    /// announcement from the same agent.
    pub fn register_remote<I, S>(&self, agent_id: AgentId, task_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let task_types: Vec<String> = task_types.into_iter().map(Into::into).collect();
        debug!(agent_id = %agent_id, task_types = ?task_types, "Remote agent announced");
        self.agents.write().insert(
            agent_id,
            RegisteredAgent {
                registration: Registration::Remote { task_types },
                registered_at: Utc::now(),
            },
        );
    }

    fn insert(&self, agent_id: AgentId, registration: Registration) -> Result<(), AgentRegistryError> {
        let mut agents = self.agents.write();
        if agents.contains_key(&agent_id) {
            return Err(AgentRegistryError::AlreadyRegistered(agent_id));
        }
        agents.insert(
            agent_id,
            RegisteredAgent {
                registration,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, agent_id: &AgentId) -> bool {
        let removed = self.agents.write().remove(agent_id).is_some();
        if removed {
            info!(agent_id = %agent_id, "Agent unregistered");
        }
        removed
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn registered_at(&self, agent_id: &AgentId) -> Option<DateTime<Utc>> {
        self.agents.read().get(agent_id).map(|a| a.registered_at)
    }

    /// Agents serving `task_type`, ordered by id.
    pub fn agents_for(&self, task_type: &str) -> Vec<AgentId> {
        self.agents
            .read()
            .iter()
            .filter(|(_, agent)| agent.task_types().iter().any(|t| t == task_type))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.agents
            .read()
            .values()
            .any(|agent| agent.task_types().iter().any(|t| t == task_type))
    }

    pub fn health(&self, agent_id: &AgentId) -> Option<RuntimeHealth> {
        match &self.agents.read().get(agent_id)?.registration {
            Registration::Local(source) => Some(source.health()),
            Registration::Remote { .. } => None,
        }
    }

    pub fn health_all(&self) -> AggregatedHealth {
        let agents = self.agents.read();
        let mut local = Vec::new();
        let mut remote_agents = Vec::new();
        for (id, agent) in agents.iter() {
            match &agent.registration {
                Registration::Local(source) => local.push(source.health()),
                Registration::Remote { .. } => remote_agents.push(id.clone()),
            }
        }
        drop(agents);

        AggregatedHealth {
            live: local.iter().all(|h| h.lifecycle_state.is_live()),
            ready: local.iter().all(|h| h.lifecycle_state.accepts_tasks()),
            agents: local,
            remote_agents,
            checked_at: Utc::now(),
        }
    }
}
