//! SQLite checkpoint store.
//!
//! Each save inserts the snapshot row and moves the agent's head pointer
//! in one immediate transaction, so a reader sees either the previous
//! generation or the new one, never a head without its snapshot.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{AgentState, CheckpointError, CheckpointStore};
use crate::task::AgentId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    agent_id TEXT NOT NULL,
    generation INTEGER NOT NULL,
    body TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, generation)
);

CREATE TABLE IF NOT EXISTS checkpoint_heads (
    agent_id TEXT PRIMARY KEY,
    generation INTEGER NOT NULL
);
"#;

/// Snapshot rows plus a per-agent head pointer, both updated in one
/// transaction.
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
    retain_generations: usize,
}

impl SqliteCheckpointStore {
    pub fn open<P: AsRef<Path>>(path: P, retain_generations: usize) -> Result<Self, CheckpointError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn, retain_generations)
    }

    pub fn in_memory(retain_generations: usize) -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?, retain_generations)
    }

    fn init(conn: Connection, retain_generations: usize) -> Result<Self, CheckpointError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retain_generations,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn save(&self, state: &AgentState) -> Result<u64, CheckpointError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let agent = state.agent_id.as_str();

        let highest: Option<i64> = tx.query_row(
            "SELECT MAX(generation) FROM checkpoints WHERE agent_id = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        let generation = highest.unwrap_or(0) as u64 + 1;

        let mut snapshot = state.clone();
        snapshot.generation = generation;
        let body = serde_json::to_string(&snapshot).map_err(|e| CheckpointError::Storage(e.to_string()))?;

        tx.execute(
            "INSERT INTO checkpoints (agent_id, generation, body, saved_at) VALUES (?1, ?2, ?3, ?4)",
            params![agent, generation as i64, body, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "INSERT INTO checkpoint_heads (agent_id, generation) VALUES (?1, ?2)
             ON CONFLICT(agent_id) DO UPDATE SET generation = excluded.generation",
            params![agent, generation as i64],
        )?;
        let keep_from = generation.saturating_sub(self.retain_generations as u64) as i64;
        tx.execute(
            "DELETE FROM checkpoints WHERE agent_id = ?1 AND generation < ?2",
            params![agent, keep_from],
        )?;
        tx.commit()?;
        Ok(generation)
    }

    async fn load(&self, agent_id: &AgentId) -> Result<Option<AgentState>, CheckpointError> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT c.body FROM checkpoint_heads h
                 JOIN checkpoints c ON c.agent_id = h.agent_id AND c.generation = h.generation
                 WHERE h.agent_id = ?1",
                params![agent_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|body| {
            serde_json::from_str(&body).map_err(|e| CheckpointError::Corrupt {
                agent_id: agent_id.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LifecycleState;

    #[tokio::test]
    async fn test_head_follows_latest_save() {
        let store = SqliteCheckpointStore::in_memory(1).unwrap();
        let agent = AgentId::new("w");
        for version in ["1", "2", "3"] {
            store
                .save(&AgentState::new(agent.clone(), LifecycleState::Running, version))
                .await
                .unwrap();
        }
        let loaded = store.load(&agent).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 3);
        assert_eq!(loaded.config_version, "3");

        let conn = store.conn.lock().await;
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.db");
        let agent = AgentId::new("w");
        {
            let store = SqliteCheckpointStore::open(&path, 3).unwrap();
            store
                .save(&AgentState::new(agent.clone(), LifecycleState::Degraded, "9"))
                .await
                .unwrap();
        }
        let store = SqliteCheckpointStore::open(&path, 3).unwrap();
        let loaded = store.load(&agent).await.unwrap().unwrap();
        assert_eq!(loaded.lifecycle_state, LifecycleState::Degraded);
    }
}
