use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::task::AgentId;

/// Lifecycle of an agent runtime.
///
/// `Created → Initializing → Running ⇄ Degraded`, then `Draining → Stopped`.
/// Any state may go straight to `Stopped` on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Initializing,
    Running,
    Degraded,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Running)
                | (Running, Degraded)
                | (Degraded, Running)
                | (Running, Draining)
                | (Degraded, Draining)
                | (Draining, Stopped)
        ) || (next == Stopped && self != Stopped)
    }

    /// Whether new tasks are admitted.
    pub fn accepts_tasks(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Degraded)
    }

    pub fn is_live(self) -> bool {
        self != LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Current lifecycle state behind a watch channel.
#[derive(Debug)]
pub struct Lifecycle {
    agent_id: AgentId,
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(agent_id: AgentId) -> Self {
        let (tx, _) = watch::channel(LifecycleState::Created);
        Self { agent_id, tx }
    }

    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        let mut result = Ok(next);
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                result = Err(LifecycleError { from: *state, to: next });
                return false;
            }
            let from = *state;
            *state = next;
            result = Ok(from);
            true
        });
        if let Ok(from) = result {
            if from != next {
                info!(agent_id = %self.agent_id, from = %from, to = %next, "Lifecycle transition");
            }
        }
        result
    }

    /// Moves between `Running` and `Degraded` only; other states are left alone.
    pub fn set_degraded(&self, degraded: bool) {
        let (from, to) = if degraded {
            (LifecycleState::Running, LifecycleState::Degraded)
        } else {
            (LifecycleState::Degraded, LifecycleState::Running)
        };
        let changed = self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(agent_id = %self.agent_id, from = %from, to = %to, "Lifecycle transition");
        }
    }

    /// Resolves once the runtime reached `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}
