//! In-process transport.
//!
//! A [`LocalPeer`] is one node's link to another node in the same process.
//! Links are directional and can be cut and restored, which is how the
//! simulator and the tests model partitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::{RaftError, Result};
use crate::raft::rpc::{
    AppendLogEntriesParam, AppendLogReply, PreVoteParam, RaftService, Reply,
    ReplicateSnapshotParam, RequestVoteParam,
};
use crate::raft::{Node, NodeId};

pub struct LocalPeer {
    id: NodeId,
    target: Weak<Node>,
    connected: AtomicBool,
}

impl LocalPeer {
    pub fn new(target: &Arc<Node>) -> Self {
        Self {
            id: target.id(),
            target: Arc::downgrade(target),
            connected: AtomicBool::new(true),
        }
    }

    /// Drop every call until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn target(&self) -> Result<Arc<Node>> {
        if !self.is_connected() {
            return Err(RaftError::Transport(format!("link to node {} is down", self.id)));
        }
        self.target
            .upgrade()
            .ok_or_else(|| RaftError::Transport(format!("node {} is gone", self.id)))
    }
}

#[async_trait]
impl RaftService for LocalPeer {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn pre_vote(&self, param: PreVoteParam) -> Result<Reply> {
        self.target()?.pre_vote(param).await
    }

    async fn request_vote(&self, param: RequestVoteParam) -> Result<Reply> {
        self.target()?.request_vote(param).await
    }

    async fn append_log_entries(&self, param: AppendLogEntriesParam) -> Result<AppendLogReply> {
        let target = self.target()?;
        let reply = target.append_log_entries(param).await?;
        // A link cut while the call was in flight loses the reply
        if !self.is_connected() {
            return Err(RaftError::Transport(format!("link to node {} is down", self.id)));
        }
        Ok(reply)
    }

    async fn replicate_snapshot(&self, param: ReplicateSnapshotParam) -> Result<Reply> {
        self.target()?.replicate_snapshot(param).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;

    #[tokio::test]
    async fn test_disconnected_link_fails_calls() {
        let node = Node::in_memory(7, RaftConfig::default());
        let peer = LocalPeer::new(&node);
        assert_eq!(peer.id(), 7);

        let param = PreVoteParam {
            node_id: 1,
            term: 1,
            last_log_term: 0,
            last_log_idx: 0,
        };
        // Reachable, but the node was never started
        assert_eq!(peer.pre_vote(param.clone()).await, Err(RaftError::NotReady));

        peer.disconnect();
        assert!(matches!(peer.pre_vote(param.clone()).await, Err(RaftError::Transport(_))));

        peer.reconnect();
        drop(node);
        assert!(matches!(peer.pre_vote(param).await, Err(RaftError::Transport(_))));
    }
}
