//! Subject and consumer naming.

use crate::task::AgentId;

/// Broadcast subject for cross-runtime cancellation requests
pub const CONTROL_CANCEL: &str = "control.cancel";

/// Work partition for one task type.
pub fn tasks(task_type: &str) -> String {
    format!("tasks.{task_type}")
}

/// Shared durable consumer of a work partition; runtimes using it compete.
pub fn workers(task_type: &str) -> String {
    format!("workers.{task_type}")
}

/// Reply subject of an agent.
pub fn results(agent_id: &AgentId) -> String {
    format!("results.{agent_id}")
}

/// Private consumer name of an agent.
pub fn private_consumer(agent_id: &AgentId) -> String {
    format!("agent.{agent_id}")
}
