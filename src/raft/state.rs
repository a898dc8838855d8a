use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use super::{LogIndex, NodeId, Term};

/// Command payload of a no-op barrier entry. Data storages skip it.
pub const NO_OP: &str = "";

/// Role of a node in the cluster.
///
/// `Stranger` is both the state before `start()` and after `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftState {
    Stranger,
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl RaftState {
    pub const ALL: [RaftState; 5] = [
        RaftState::Stranger,
        RaftState::Follower,
        RaftState::PreCandidate,
        RaftState::Candidate,
        RaftState::Leader,
    ];
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftState::Stranger => write!(f, "stranger"),
            RaftState::Follower => write!(f, "follower"),
            RaftState::PreCandidate => write!(f, "pre-candidate"),
            RaftState::Candidate => write!(f, "candidate"),
            RaftState::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the replicated log.
///
/// Index 0 holds a sentinel (term 0, empty command) so every real entry has a
/// predecessor to compare against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: String,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: impl Into<String>) -> Self {
        Self {
            index,
            term,
            command: command.into(),
        }
    }

    pub fn sentinel() -> Self {
        Self::new(0, 0, NO_OP)
    }

    pub fn is_no_op(&self) -> bool {
        self.command == NO_OP
    }
}

/// Compacted state machine contents up to and including `apply_idx`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub apply_term: Term,
    pub apply_idx: LogIndex,
    pub data: Vec<u8>,
}

/// Durable election metadata.
///
/// # Invariants
///
/// - `term` never decreases and is written to the meta storage before any
///   reply that carries it leaves the node.
/// - `voted_for` belongs to `term`: whenever the term advances the vote is
///   cleared, unless the same step records a new vote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentProperties {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Last accepted communication from a current-or-newer-term leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatState {
    last_heartbeat_term: Term,
    last_heartbeat_at: Option<Instant>,
}

impl HeartbeatState {
    /// Record a heartbeat. Heartbeats from an older term than the last
    /// recorded one are ignored.
    pub fn set(&mut self, term: Term, at: Instant) -> bool {
        if term < self.last_heartbeat_term {
            return false;
        }
        self.last_heartbeat_term = term;
        self.last_heartbeat_at = Some(at);
        true
    }

    pub fn term(&self) -> Term {
        self.last_heartbeat_term
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    /// Whether a heartbeat was seen less than `window` ago.
    pub fn heard_within(&self, window: Duration) -> bool {
        self.last_heartbeat_at
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }
}

/// Check if a requester's log is at least as up-to-date as ours.
///
/// A log is up-to-date if its last term is greater, or the terms are equal
/// and its last index is greater or equal.
pub fn is_log_up_to_date(
    local_last: (Term, LogIndex),
    last_log_term: Term,
    last_log_idx: LogIndex,
) -> bool {
    let (our_last_term, our_last_index) = local_last;
    last_log_term > our_last_term
        || (last_log_term == our_last_term && last_log_idx >= our_last_index)
}
