pub mod config;
pub mod error;
pub mod raft;
pub mod storage;
pub mod transport;

pub use config::{LogConfig, RaftConfig};
pub use error::{RaftError, Result};
pub use raft::{Node, NodeStatus, RaftService, RaftState};
pub use transport::LocalPeer;
