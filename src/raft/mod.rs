//! Raft consensus core with pre-vote.
//!
//! # Components
//!
//! - [`machine`]: role state machine. A static transition table plus a
//!   single-consumer event loop; the only place role changes happen.
//! - [`node::Node`]: RPC handlers, the public `propose` API, lifecycle.
//! - [`roles`]: the side effects run on entering and leaving each role.
//! - [`proxy::NodeProxy`]: per-follower replication pipeline (leader only).
//! - [`propose::ProposeHelper`]: fan-out of proposals and in-order local apply.
//! - [`log::LogManager`]: gapless log cache over a [`LogStorage`](crate::storage::LogStorage).
//! - [`meta::MetaDataManager`]: durable term / vote bookkeeping.
//! - [`timer`] and [`pool`]: role-owned schedulers and bounded worker pools.
//!
//! # Election Flow
//!
//! ```text
//! STRANGER --INIT--> FOLLOWER <-----------+--------------+---------------+
//!                        |                 |              |               |
//!                  PING_TIMEOUT     PREVOTE_FAILED   VOTE_FAILED   NETWORK_PARTITION
//!                        v                 |              |               |
//!                  PRE_CANDIDATE ----------+              |               |
//!                        |                                |               |
//!                 PREVOTE_SUCCESS                         |               |
//!                        v                                |               |
//!                    CANDIDATE ---------------------------+               |
//!                        |                                                |
//!                    TO_LEADER                                            |
//!                        v                                                |
//!                     LEADER ---------------------------------------------+
//! ```
//!
//! `ACCEPT_LEADER` and `FORCE_FOLLOWER` bring any active role back to
//! follower; `STOP` returns to stranger.

pub mod log;
pub mod machine;
pub mod meta;
pub mod node;
pub mod pool;
pub mod propose;
pub mod proxy;
pub mod roles;
pub mod rpc;
pub mod state;
pub mod timer;

/// Node ID in the cluster
pub type NodeId = u64;

/// Term number
pub type Term = u64;

/// Log index
pub type LogIndex = u64;

pub use machine::{RaftAction, RaftEvent, RaftMachine, Transition};
pub use node::{Node, NodeStatus};
pub use rpc::{
    AppendLogEntriesParam, AppendLogReply, PreVoteParam, RaftService, Reply,
    ReplicateSnapshotParam, RequestVoteParam,
};
pub use state::{LogEntry, PersistentProperties, RaftState, Snapshot};
