use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::state::{LogEntry, NO_OP};
use super::{LogIndex, Term};
use crate::config::LogConfig;
use crate::error::{RaftError, Result};
use crate::storage::LogStorage;

struct LogCache {
    /// Most recent entries. Older ones are evicted and read back from storage.
    entries: BTreeMap<LogIndex, LogEntry>,
    /// Lowest retained index. The entry there is the snapshot placeholder
    /// (or the index 0 sentinel) and is never applied.
    horizon: LogIndex,
    last: (Term, LogIndex),
}

/// Gapless log over a [`LogStorage`], with an in-memory tail cache.
///
/// Every write goes to storage first; the cache only mirrors it.
pub struct LogManager {
    storage: Arc<dyn LogStorage>,
    config: LogConfig,
    inner: RwLock<LogCache>,
}

impl LogManager {
    pub fn new(storage: Arc<dyn LogStorage>, config: LogConfig) -> Self {
        Self {
            storage,
            config,
            inner: RwLock::new(LogCache {
                entries: BTreeMap::from([(0, LogEntry::sentinel())]),
                horizon: 0,
                last: (0, 0),
            }),
        }
    }

    /// Load the latest backlog at or above `apply_idx`.
    ///
    /// When storage has no entry at `apply_idx` (fresh log, or a log that
    /// was replaced by a snapshot) a placeholder carrying `apply_term` is
    /// written there so the log starts without a gap.
    pub async fn init(&self, apply_idx: LogIndex, apply_term: Term) -> Result<()> {
        let mut inner = self.inner.write().await;

        let anchor = match self.read_one(apply_idx).await? {
            Some(entry) => entry,
            None => {
                let placeholder = LogEntry::new(apply_idx, apply_term, NO_OP);
                self.storage.write(&placeholder).await?;
                placeholder
            }
        };

        let loaded = self
            .storage
            .load_from_apply_idx(self.config.load_len, apply_idx)
            .await?;

        // The cache must stay a contiguous suffix of the log
        let mut entries = BTreeMap::new();
        if loaded.first().map_or(true, |e| e.index <= apply_idx + 1) {
            entries.insert(anchor.index, anchor.clone());
        }
        for entry in loaded {
            entries.insert(entry.index, entry);
        }
        let last = entries
            .last_key_value()
            .map(|(_, e)| (e.term, e.index))
            .unwrap_or((anchor.term, anchor.index));

        tracing::debug!(
            apply_idx,
            last_idx = last.1,
            cached = entries.len(),
            "Loaded log backlog"
        );
        *inner = LogCache {
            entries,
            horizon: apply_idx,
            last,
        };
        Ok(())
    }

    /// `(term, index)` of the highest entry.
    pub async fn last_log(&self) -> (Term, LogIndex) {
        self.inner.read().await.last
    }

    pub async fn horizon(&self) -> LogIndex {
        self.inner.read().await.horizon
    }

    /// Allocate the next index for `command` and persist the entry.
    pub async fn create_log(&self, term: Term, command: impl Into<String>) -> Result<LogEntry> {
        let mut inner = self.inner.write().await;
        let entry = LogEntry::new(inner.last.1 + 1, term, command);
        self.storage.write(&entry).await?;
        inner.last = (entry.term, entry.index);
        self.cache(&mut inner, entry.clone());
        Ok(entry)
    }

    /// Write `entry` at its index.
    ///
    /// Re-appending an identical entry does nothing. An entry whose term
    /// conflicts with the one already stored replaces it and drops every
    /// entry after it. Writing past `last + 1` would leave a gap and fails.
    pub async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        if entry.index <= inner.horizon {
            return Ok(());
        }
        if entry.index > inner.last.1 + 1 {
            return Err(RaftError::Storage(format!(
                "append at {} would leave a gap after {}",
                entry.index, inner.last.1
            )));
        }

        if entry.index <= inner.last.1 {
            match self.get_cached_or_stored(&inner, entry.index).await? {
                Some(existing) if existing == *entry => return Ok(()),
                Some(existing) if existing.term != entry.term => {
                    tracing::debug!(
                        index = entry.index,
                        old_term = existing.term,
                        new_term = entry.term,
                        "Conflicting entry, truncating log"
                    );
                    self.truncate_locked(&mut inner, entry.index - 1).await?;
                }
                _ => {}
            }
        }

        self.storage.write(entry).await?;
        if entry.index >= inner.last.1 {
            inner.last = (entry.term, entry.index);
        }
        self.cache(&mut inner, entry.clone());
        Ok(())
    }

    pub async fn get_log(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        let inner = self.inner.read().await;
        self.get_cached_or_stored(&inner, index).await
    }

    /// Term of the entry at `index`, if it is retained.
    pub async fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        Ok(self.get_log(index).await?.map(|e| e.term))
    }

    /// Entries in `[start, end)`, clipped to the retained range.
    pub async fn get_logs(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read().await;
        let start = start.max(inner.horizon);
        let end = end.min(inner.last.1 + 1);
        if start >= end {
            return Ok(Vec::new());
        }

        let cached_from = inner
            .entries
            .first_key_value()
            .map(|(idx, _)| *idx)
            .unwrap_or(end);

        let mut logs = Vec::with_capacity((end - start) as usize);
        if start < cached_from {
            let stored_end = cached_from.min(end);
            let stored = self
                .storage
                .read(start, (stored_end - start) as usize)
                .await?;
            logs.extend(stored.into_iter().filter(|e| e.index < stored_end));
        }
        logs.extend(
            inner
                .entries
                .range(start.max(cached_from)..end)
                .map(|(_, e)| e.clone()),
        );
        Ok(logs)
    }

    /// Every retained entry, horizon placeholder included.
    pub async fn entries(&self) -> Result<Vec<LogEntry>> {
        let (horizon, last) = {
            let inner = self.inner.read().await;
            (inner.horizon, inner.last.1)
        };
        self.get_logs(horizon, last + 1).await
    }

    /// Discard entries below `index`, which becomes the new horizon.
    pub async fn compact(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.write().await;
        if index <= inner.horizon || index > inner.last.1 {
            return Ok(());
        }
        self.storage.compact(index).await?;
        inner.entries = inner.entries.split_off(&index);
        inner.horizon = index;
        tracing::debug!(horizon = index, "Compacted log");
        Ok(())
    }

    /// Replace the whole log by a single placeholder at `index`.
    pub async fn reset_to(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut inner = self.inner.write().await;
        let placeholder = LogEntry::new(index, term, NO_OP);
        self.storage.truncate_after(index).await?;
        self.storage.compact(index).await?;
        self.storage.write(&placeholder).await?;
        *inner = LogCache {
            entries: BTreeMap::from([(index, placeholder)]),
            horizon: index,
            last: (term, index),
        };
        Ok(())
    }

    async fn truncate_locked(&self, inner: &mut LogCache, index: LogIndex) -> Result<()> {
        if index >= inner.last.1 {
            return Ok(());
        }
        let index = index.max(inner.horizon);
        self.storage.truncate_after(index).await?;
        let _ = inner.entries.split_off(&(index + 1));
        let term = match self.get_cached_or_stored(inner, index).await? {
            Some(entry) => entry.term,
            None => {
                return Err(RaftError::Storage(format!(
                    "entry {} missing after truncation",
                    index
                )))
            }
        };
        inner.last = (term, index);
        Ok(())
    }

    async fn get_cached_or_stored(
        &self,
        inner: &LogCache,
        index: LogIndex,
    ) -> Result<Option<LogEntry>> {
        if index < inner.horizon || index > inner.last.1 {
            return Ok(None);
        }
        if let Some(entry) = inner.entries.get(&index) {
            return Ok(Some(entry.clone()));
        }
        self.read_one(index).await
    }

    async fn read_one(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self
            .storage
            .read(index, 1)
            .await?
            .into_iter()
            .find(|e| e.index == index))
    }

    fn cache(&self, inner: &mut LogCache, entry: LogEntry) {
        inner.entries.insert(entry.index, entry);
        while inner.entries.len() > self.config.cache_capacity {
            if inner.entries.pop_first().is_none() {
                break;
            }
        }
    }
}
