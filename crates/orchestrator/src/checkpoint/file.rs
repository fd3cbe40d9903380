//! Directory-backed checkpoint store.
//!
//! Layout per agent:
//!
//! ```text
//! <root>/<agent>/gen-00000000000000000042.json
//! <root>/<agent>/CURRENT            -> "42"
//! ```
//!
//! A save writes and fsyncs the new generation file, then replaces `CURRENT`
//! by renaming a temp file over it. Readers only follow `CURRENT`, so a
//! generation file without a pointer (torn or in progress) is never loaded.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{storage_key, AgentState, CheckpointError, CheckpointStore};
use crate::task::AgentId;

const CURRENT: &str = "CURRENT";
const GEN_PREFIX: &str = "gen-";
const GEN_SUFFIX: &str = ".json";

pub struct FileCheckpointStore {
    root: PathBuf,
    retain_generations: usize,
    /// Serializes saves so generation numbers are unique
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl AsRef<Path>, retain_generations: usize) -> Result<Self, CheckpointError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retain_generations,
            write_lock: Mutex::new(()),
        })
    }

    fn agent_dir(&self, agent_id: &AgentId) -> PathBuf {
        self.root.join(storage_key(agent_id))
    }

    fn generation_path(dir: &Path, generation: u64) -> PathBuf {
        dir.join(format!("{GEN_PREFIX}{generation:020}{GEN_SUFFIX}"))
    }

    fn parse_generation(name: &str) -> Option<u64> {
        name.strip_prefix(GEN_PREFIX)?
            .strip_suffix(GEN_SUFFIX)?
            .parse()
            .ok()
    }

    async fn current_generation(dir: &Path) -> Result<Option<u64>, CheckpointError> {
        match fs::read_to_string(dir.join(CURRENT)).await {
            Ok(raw) => Ok(raw.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Generation numbers present on disk, ascending.
    async fn generations_on_disk(dir: &Path) -> Result<Vec<u64>, CheckpointError> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(generation) = entry.file_name().to_str().and_then(Self::parse_generation) {
                found.push(generation);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    async fn write_durably(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn prune(&self, dir: &Path, current: u64) -> Result<(), CheckpointError> {
        let keep_from = current.saturating_sub(self.retain_generations as u64);
        for generation in Self::generations_on_disk(dir).await? {
            if generation < keep_from {
                if let Err(e) = fs::remove_file(Self::generation_path(dir, generation)).await {
                    warn!(dir = %dir.display(), generation, error = %e, "Failed to prune checkpoint");
                }
            }
        }
        Ok(())
    }

    async fn read_generation(dir: &Path, agent_id: &AgentId, generation: u64) -> Result<AgentState, CheckpointError> {
        let raw = fs::read(Self::generation_path(dir, generation)).await?;
        serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt {
            agent_id: agent_id.to_string(),
            reason: format!("generation {generation}: {e}"),
        })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn save(&self, state: &AgentState) -> Result<u64, CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.agent_dir(&state.agent_id);
        fs::create_dir_all(&dir).await?;

        // a torn file above CURRENT must not be reused as the next generation
        let highest_on_disk = Self::generations_on_disk(&dir).await?.last().copied();
        let current = Self::current_generation(&dir).await?;
        let generation = highest_on_disk.max(current).unwrap_or(0) + 1;

        let mut snapshot = state.clone();
        snapshot.generation = generation;
        let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| CheckpointError::Io(e.to_string()))?;

        Self::write_durably(&Self::generation_path(&dir, generation), &body).await?;
        Self::write_durably(&dir.join(CURRENT), generation.to_string().as_bytes()).await?;
        debug!(agent_id = %state.agent_id, generation, "Checkpoint pointer swapped");

        self.prune(&dir, generation).await?;
        Ok(generation)
    }

    async fn load(&self, agent_id: &AgentId) -> Result<Option<AgentState>, CheckpointError> {
        let dir = self.agent_dir(agent_id);
        let Some(current) = Self::current_generation(&dir).await? else {
            return Ok(None);
        };

        match Self::read_generation(&dir, agent_id, current).await {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                // fall back to the newest retained generation below the pointer
                warn!(agent_id = %agent_id, generation = current, error = %err, "Current checkpoint unreadable");
                let older = Self::generations_on_disk(&dir).await?;
                for generation in older.into_iter().rev().filter(|g| *g < current) {
                    if let Ok(state) = Self::read_generation(&dir, agent_id, generation).await {
                        warn!(agent_id = %agent_id, generation, "Restored from previous checkpoint generation");
                        return Ok(Some(state));
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LifecycleState;
    use serde_json::json;
    use std::sync::Arc;

    fn state(agent: &str, n: u64) -> AgentState {
        let mut s = AgentState::new(AgentId::new(agent), LifecycleState::Running, "1");
        s.handlers.insert("counter".into(), json!({ "n": n }));
        s
    }

    #[tokio::test]
    async fn test_save_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 2).unwrap();

        for n in 1..=5 {
            assert_eq!(store.save(&state("w", n)).await.unwrap(), n);
        }
        let loaded = store.load(&AgentId::new("w")).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 5);
        assert_eq!(loaded.handlers["counter"]["n"], 5);

        // current plus two superseded generations survive pruning
        let kept = FileCheckpointStore::generations_on_disk(&dir.path().join("w")).await.unwrap();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_torn_write_is_never_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3).unwrap();
        store.save(&state("w", 1)).await.unwrap();

        // crash after writing the next generation but before swapping the pointer
        let agent_dir = dir.path().join("w");
        std::fs::write(FileCheckpointStore::generation_path(&agent_dir, 2), b"{\"agent_id\": \"w\", \"lif").unwrap();

        let loaded = store.load(&AgentId::new("w")).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 1);

        // the next save skips past the torn generation
        assert_eq!(store.save(&state("w", 3)).await.unwrap(), 3);
        assert_eq!(store.load(&AgentId::new("w")).await.unwrap().unwrap().generation, 3);
    }

    #[tokio::test]
    async fn test_corrupt_current_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3).unwrap();
        store.save(&state("w", 1)).await.unwrap();
        store.save(&state("w", 2)).await.unwrap();

        let agent_dir = dir.path().join("w");
        std::fs::write(FileCheckpointStore::generation_path(&agent_dir, 2), b"garbage").unwrap();

        let loaded = store.load(&AgentId::new("w")).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_a_complete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path(), 3).unwrap());

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.save(&state("w", n)).await }));
        }
        let mut generations = Vec::new();
        for h in handles {
            generations.push(h.await.unwrap().unwrap());
        }
        generations.sort_unstable();
        assert_eq!(generations, (1..=16).collect::<Vec<_>>());

        let loaded = store.load(&AgentId::new("w")).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 16);
        assert!(loaded.handlers["counter"]["n"].as_u64().unwrap() < 16);
    }

    #[tokio::test]
    async fn test_unknown_agent_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3).unwrap();
        assert!(store.load(&AgentId::new("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_differing_only_in_separators_keep_separate_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 2).unwrap();
        store.save(&state("a/b", 7)).await.unwrap();
        store.save(&state("a_b", 9)).await.unwrap();

        let slashed = store.load(&AgentId::new("a/b")).await.unwrap().unwrap();
        let underscored = store.load(&AgentId::new("a_b")).await.unwrap().unwrap();
        assert_eq!(slashed.handlers["counter"]["n"], 7);
        assert_eq!(underscored.handlers["counter"]["n"], 9);
        assert_eq!(slashed.agent_id, AgentId::new("a/b"));
    }
}
