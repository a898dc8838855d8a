use thiserror::Error;

use crate::raft::{LogIndex, NodeId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("Node is not ready")]
    NotReady,

    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Proposal at index {0} was not replicated to a majority")]
    ProposeFailed(LogIndex),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
