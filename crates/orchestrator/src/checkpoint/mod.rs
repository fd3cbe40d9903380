//! Checkpoint Manager
//!
//! Persists an [`AgentState`] snapshot per agent. Stores write the new
//! snapshot first and then swap the "current" pointer, so a crash mid-save
//! leaves the previous snapshot readable. Superseded snapshots are kept up to
//! `retain_generations` and never overwritten in place.

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OperationTimer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::error::{Classify, ErrorClass};
use crate::reliability::{ResilienceError, ResilienceLayer};
use crate::runtime::LifecycleState;
use crate::task::AgentId;

/// Resilience destination name of the checkpoint store
pub const CHECKPOINT_DESTINATION: &str = "checkpoint";

#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("checkpoint for '{agent_id}' is corrupt: {reason}")]
    Corrupt { agent_id: String, reason: String },

    #[error("unsupported checkpoint store url '{0}'")]
    UnsupportedUrl(String),

    #[error("checkpoint store unreachable: {0}")]
    Unreachable(String),
}

impl Classify for CheckpointError {
    fn class(&self) -> ErrorClass {
        match self {
            CheckpointError::Io(_) | CheckpointError::Storage(_) => ErrorClass::Transient,
            CheckpointError::Corrupt { .. }
            | CheckpointError::UnsupportedUrl(_)
            | CheckpointError::Unreachable(_) => ErrorClass::Recovery,
        }
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

impl From<ResilienceError<CheckpointError>> for CheckpointError {
    fn from(err: ResilienceError<CheckpointError>) -> Self {
        match err {
            ResilienceError::Permanent { error, .. } => error,
            other => CheckpointError::Unreachable(other.to_string()),
        }
    }
}

/// Recoverable state of one agent runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub lifecycle_state: LifecycleState,
    pub last_checkpoint_at: DateTime<Utc>,
    pub config_version: String,
    /// Assigned by the store on save, increasing per agent
    #[serde(default)]
    pub generation: u64,
    /// Opaque state slice of each handler, keyed by task type
    #[serde(default)]
    pub handlers: BTreeMap<String, serde_json::Value>,
}

impl AgentState {
    pub fn new(agent_id: AgentId, lifecycle_state: LifecycleState, config_version: impl Into<String>) -> Self {
        Self {
            agent_id,
            lifecycle_state,
            last_checkpoint_at: Utc::now(),
            config_version: config_version.into(),
            generation: 0,
            handlers: BTreeMap::new(),
        }
    }
}

/// Storage backend for snapshots.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist `state` as the new current snapshot; returns its generation.
    async fn save(&self, state: &AgentState) -> Result<u64, CheckpointError>;

    /// Latest complete snapshot, `None` if the agent never checkpointed.
    async fn load(&self, agent_id: &AgentId) -> Result<Option<AgentState>, CheckpointError>;
}

/// Open the store named by `config.store_url`.
pub fn open_store(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    let url = config.store_url.as_str();
    if url == "memory://" || url.is_empty() {
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    if let Some(dir) = url.strip_prefix("file://") {
        return Ok(Arc::new(FileCheckpointStore::new(dir, config.retain_generations)?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteCheckpointStore::open(path, config.retain_generations)?));
    }
    Err(CheckpointError::UnsupportedUrl(url.to_string()))
}

/// Save/load through the resilience layer. Failures are reported to the
/// caller, never escalated from here.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    resilience: Arc<ResilienceLayer>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("store", &self.store.name())
            .finish()
    }
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, resilience: Arc<ResilienceLayer>) -> Self {
        Self { store, resilience }
    }

    pub fn open(config: &CheckpointConfig, resilience: Arc<ResilienceLayer>) -> Result<Self, CheckpointError> {
        let store = open_store(config)?;
        info!(store = store.name(), url = %config.store_url, "Checkpoint store opened");
        Ok(Self::new(store, resilience))
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub async fn save(&self, state: &AgentState) -> Result<u64, CheckpointError> {
        let timer = OperationTimer::new("checkpoint.save");
        let saved = self
            .resilience
            .call(CHECKPOINT_DESTINATION, || self.store.save(state))
            .await;
        timer.finish_with_result(&saved);
        let generation = saved?;
        debug!(agent_id = %state.agent_id, generation, "Checkpoint saved");
        Ok(generation)
    }

    pub async fn load(&self, agent_id: &AgentId) -> Result<Option<AgentState>, CheckpointError> {
        let state = self
            .resilience
            .call(CHECKPOINT_DESTINATION, || self.store.load(agent_id))
            .await?;
        if let Some(state) = &state {
            debug!(agent_id = %agent_id, generation = state.generation, "Checkpoint loaded");
        }
        Ok(state)
    }
}

/// File-name safe, injective rendering of an agent id: ASCII alphanumerics,
/// `-` and `_` pass through, every other byte becomes `%XX`.
pub(crate) fn storage_key(agent_id: &AgentId) -> String {
    let mut key = String::with_capacity(agent_id.as_str().len());
    for byte in agent_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("%{byte:02X}"));
        }
    }
    key
}
