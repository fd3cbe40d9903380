use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{AgentState, CheckpointError, CheckpointStore};
use crate::task::AgentId;

/// Process-local store; snapshots are swapped in whole under the lock.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: RwLock<HashMap<AgentId, Arc<AgentState>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, state: &AgentState) -> Result<u64, CheckpointError> {
        let mut states = self.states.write();
        let generation = states
            .get(&state.agent_id)
            .map_or(1, |current| current.generation + 1);
        let mut next = state.clone();
        next.generation = generation;
        states.insert(next.agent_id.clone(), Arc::new(next));
        Ok(generation)
    }

    async fn load(&self, agent_id: &AgentId) -> Result<Option<AgentState>, CheckpointError> {
        Ok(self
            .states
            .read()
            .get(agent_id)
            .map(|state| state.as_ref().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LifecycleState;

    #[tokio::test]
    async fn test_generations_increase_per_agent() {
        let store = MemoryCheckpointStore::new();
        let a = AgentState::new(AgentId::new("a"), LifecycleState::Running, "1");
        let b = AgentState::new(AgentId::new("b"), LifecycleState::Running, "1");

        assert_eq!(store.save(&a).await.unwrap(), 1);
        assert_eq!(store.save(&a).await.unwrap(), 2);
        assert_eq!(store.save(&b).await.unwrap(), 1);
        assert_eq!(store.load(&a.agent_id).await.unwrap().unwrap().generation, 2);
    }
}
