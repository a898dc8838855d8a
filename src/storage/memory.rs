use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DataStorage, LogStorage, MetaStorage};
use crate::error::{RaftError, Result};
use crate::raft::state::{LogEntry, PersistentProperties, Snapshot};
use crate::raft::{LogIndex, Term};

/// In-memory meta storage (for testing)
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStorage {
    properties: Arc<RwLock<PersistentProperties>>,
}

impl MemoryMetaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStorage for MemoryMetaStorage {
    async fn write(&self, properties: &PersistentProperties) -> Result<()> {
        *self.properties.write().await = properties.clone();
        Ok(())
    }

    async fn read(&self) -> Result<PersistentProperties> {
        Ok(self.properties.read().await.clone())
    }
}

/// In-memory log storage (for testing)
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStorage {
    entries: Arc<RwLock<BTreeMap<LogIndex, LogEntry>>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn write(&self, entry: &LogEntry) -> Result<()> {
        self.entries.write().await.insert(entry.index, entry.clone());
        Ok(())
    }

    async fn read(&self, start: LogIndex, len: usize) -> Result<Vec<LogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(start..)
            .take(len)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn load_from_apply_idx(&self, n: usize, apply_idx: LogIndex) -> Result<Vec<LogEntry>> {
        let entries = self.entries.read().await;
        let mut loaded: Vec<LogEntry> = entries
            .range(apply_idx..)
            .rev()
            .take(n)
            .map(|(_, e)| e.clone())
            .collect();
        loaded.reverse();
        Ok(loaded)
    }

    async fn truncate_after(&self, index: LogIndex) -> Result<()> {
        let mut entries = self.entries.write().await;
        let _ = entries.split_off(&index.saturating_add(1));
        Ok(())
    }

    async fn compact(&self, index: LogIndex) -> Result<()> {
        let mut entries = self.entries.write().await;
        let kept = entries.split_off(&index);
        *entries = kept;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct JournalState {
    apply_term: Term,
    apply_idx: LogIndex,
    commands: Vec<String>,
}

/// In-memory state machine that journals every applied command.
///
/// Snapshots are the JSON encoding of the journal. `save_snapshot` keeps the
/// snapshot aside so that `load_snapshot` after a restart starts from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataStorage {
    live: Arc<RwLock<JournalState>>,
    saved: Arc<RwLock<Snapshot>>,
}

impl MemoryDataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands applied so far, in apply order.
    pub async fn commands(&self) -> Vec<String> {
        self.live.read().await.commands.clone()
    }

    fn decode(data: &[u8]) -> Result<Vec<String>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(data).map_err(|e| RaftError::Storage(e.to_string()))
    }
}

#[async_trait]
impl DataStorage for MemoryDataStorage {
    async fn apply(&self, term: Term, index: LogIndex, command: &str) -> Result<()> {
        let mut live = self.live.write().await;
        if index != live.apply_idx + 1 {
            tracing::warn!(
                index,
                apply_idx = live.apply_idx,
                "Discontinuous log index, ignoring apply"
            );
            return Ok(());
        }
        live.apply_term = term;
        live.apply_idx = index;
        if command != crate::raft::state::NO_OP {
            live.commands.push(command.to_string());
        }
        Ok(())
    }

    async fn apply_idx(&self) -> LogIndex {
        self.live.read().await.apply_idx
    }

    async fn load_snapshot(&self) -> Result<LogIndex> {
        let saved = self.saved.read().await.clone();
        let commands = Self::decode(&saved.data)?;
        *self.live.write().await = JournalState {
            apply_term: saved.apply_term,
            apply_idx: saved.apply_idx,
            commands,
        };
        Ok(saved.apply_idx)
    }

    async fn get_snapshot(&self) -> Result<Snapshot> {
        let live = self.live.read().await;
        let data =
            serde_json::to_vec(&live.commands).map_err(|e| RaftError::Storage(e.to_string()))?;
        Ok(Snapshot {
            apply_term: live.apply_term,
            apply_idx: live.apply_idx,
            data,
        })
    }

    async fn save_snapshot(&self, term: Term, index: LogIndex, data: &[u8]) -> Result<()> {
        let commands = Self::decode(data)?;
        let mut live = self.live.write().await;
        *live = JournalState {
            apply_term: term,
            apply_idx: index,
            commands,
        };
        *self.saved.write().await = Snapshot {
            apply_term: term,
            apply_idx: index,
            data: data.to_vec(),
        };
        Ok(())
    }
}
