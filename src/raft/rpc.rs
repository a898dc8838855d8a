//! RPC entities and the transport-agnostic service trait.
//!
//! Handlers answer stale terms and log mismatches with `success: false`
//! replies. An `Err` means there was no answer at all: the target is not
//! ready or cannot be reached. Callers count both as non-success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::state::LogEntry;
use super::{LogIndex, NodeId, Term};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteParam {
    pub node_id: NodeId,
    pub term: Term,
    pub last_log_term: Term,
    pub last_log_idx: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteParam {
    pub node_id: NodeId,
    pub term: Term,
    pub last_log_term: Term,
    pub last_log_idx: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogEntriesParam {
    pub node_id: NodeId,
    pub term: Term,
    pub pre_log_term: Term,
    pub pre_log_idx: LogIndex,
    pub commit_idx: LogIndex,
    pub logs: Vec<LogEntry>,
}

impl AppendLogEntriesParam {
    /// An entry-less AppendLogEntries, used as the leader heartbeat.
    pub fn heartbeat(node_id: NodeId, term: Term, commit_idx: LogIndex) -> Self {
        Self {
            node_id,
            term,
            pre_log_term: 0,
            pre_log_idx: 0,
            commit_idx,
            logs: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.logs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateSnapshotParam {
    pub node_id: NodeId,
    pub term: Term,
    pub apply_idx: LogIndex,
    pub apply_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub term: Term,
}

impl Reply {
    pub fn accept(term: Term) -> Self {
        Self {
            success: true,
            term,
        }
    }

    pub fn reject(term: Term) -> Self {
        Self {
            success: false,
            term,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogReply {
    pub success: bool,
    pub term: Term,
    /// The follower's committed index is ahead of the leader's; it needs a
    /// full snapshot before it can take more entries.
    pub sync_snapshot: bool,
    /// Index the leader should resume replication after, when the follower
    /// log does not line up with `pre_log_idx`.
    pub compare_idx: Option<LogIndex>,
}

impl AppendLogReply {
    pub fn accept(term: Term) -> Self {
        Self {
            success: true,
            term,
            sync_snapshot: false,
            compare_idx: None,
        }
    }

    pub fn reject(term: Term) -> Self {
        Self {
            success: false,
            term,
            sync_snapshot: false,
            compare_idx: None,
        }
    }

    pub fn request_snapshot(term: Term) -> Self {
        Self {
            sync_snapshot: true,
            ..Self::reject(term)
        }
    }

    pub fn repair_from(term: Term, compare_idx: LogIndex) -> Self {
        Self {
            compare_idx: Some(compare_idx),
            ..Self::reject(term)
        }
    }
}

/// Node-to-node RPC surface.
///
/// Implemented by [`Node`](super::Node) for in-process calls and by
/// transports such as [`LocalPeer`](crate::transport::LocalPeer).
#[async_trait]
pub trait RaftService: Send + Sync {
    fn id(&self) -> NodeId;

    async fn pre_vote(&self, param: PreVoteParam) -> Result<Reply>;

    async fn request_vote(&self, param: RequestVoteParam) -> Result<Reply>;

    async fn append_log_entries(&self, param: AppendLogEntriesParam) -> Result<AppendLogReply>;

    async fn replicate_snapshot(&self, param: ReplicateSnapshotParam) -> Result<Reply>;
}
