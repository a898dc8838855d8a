//! Storage collaborators consumed by the consensus core.
//!
//! The core never touches disk itself. It talks to three contracts:
//!
//! - [`MetaStorage`]: durable `(term, voted_for)`
//! - [`LogStorage`]: append-only log entries, addressed by index
//! - [`DataStorage`]: the replicated state machine and its snapshots
//!
//! [`memory`] provides in-memory implementations used by tests and the demo
//! binary. They survive a node `stop()`/`start()` cycle, which is how tests
//! simulate a crash and restart.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::raft::state::{LogEntry, PersistentProperties, Snapshot};
use crate::raft::{LogIndex, Term};

pub use memory::{MemoryDataStorage, MemoryLogStorage, MemoryMetaStorage};

#[async_trait]
pub trait MetaStorage: Send + Sync {
    async fn write(&self, properties: &PersistentProperties) -> Result<()>;

    async fn read(&self) -> Result<PersistentProperties>;
}

#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Write an entry at its index, replacing any entry already there.
    async fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Read up to `len` contiguous entries starting at `start`.
    async fn read(&self, start: LogIndex, len: usize) -> Result<Vec<LogEntry>>;

    /// Load the most recent `n` entries whose index is at least `apply_idx`,
    /// in ascending index order.
    async fn load_from_apply_idx(&self, n: usize, apply_idx: LogIndex) -> Result<Vec<LogEntry>>;

    /// Drop every entry with an index greater than `index`.
    async fn truncate_after(&self, index: LogIndex) -> Result<()>;

    /// Drop every entry with an index lower than `index`.
    async fn compact(&self, index: LogIndex) -> Result<()>;
}

#[async_trait]
pub trait DataStorage: Send + Sync {
    /// Apply a committed command. Indices that do not directly follow the
    /// current apply index are ignored.
    async fn apply(&self, term: Term, index: LogIndex, command: &str) -> Result<()>;

    async fn apply_idx(&self) -> LogIndex;

    /// Restore the last saved snapshot and return its apply index.
    async fn load_snapshot(&self) -> Result<LogIndex>;

    /// Capture the current state.
    async fn get_snapshot(&self) -> Result<Snapshot>;

    /// Replace the current state with `data` and persist it as the latest snapshot.
    async fn save_snapshot(&self, term: Term, index: LogIndex, data: &[u8]) -> Result<()>;
}
