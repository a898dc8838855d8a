//! Role state machine.
//!
//! [`transition`] is the static table: a pure function from `(state, event)`
//! to the actions to run and the next state. [`RaftMachine`] owns the event
//! queue and the single loop that drains it, running the actions through an
//! [`ActionExecutor`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::RaftState;
use super::{NodeId, Term};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftEvent {
    Init,
    PingTimeout,
    PrevoteSuccess,
    PrevoteFailed,
    ToLeader,
    VoteFailed,
    /// A legitimate leader for the carried term was heard from. Jumps the queue.
    AcceptLeader,
    /// The leader lost contact with a majority.
    NetworkPartition,
    ForceFollower,
    Stop,
}

impl RaftEvent {
    pub const ALL: [RaftEvent; 10] = [
        RaftEvent::Init,
        RaftEvent::PingTimeout,
        RaftEvent::PrevoteSuccess,
        RaftEvent::PrevoteFailed,
        RaftEvent::ToLeader,
        RaftEvent::VoteFailed,
        RaftEvent::AcceptLeader,
        RaftEvent::NetworkPartition,
        RaftEvent::ForceFollower,
        RaftEvent::Stop,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftAction {
    /// Allocate the worker pools of an active node.
    Init,
    /// Start the heartbeat timeout check.
    PostFollower,
    RemoveFollowerScheduler,
    /// Run the pre-vote round.
    ToPreCandidate,
    /// Increment the term and run the vote round.
    PostCandidate,
    /// Start replication pipelines, heartbeats and the no-op barrier.
    PostLeader,
    /// Stop heartbeats and replication pipelines.
    RemoveLeaderScheduler,
    AcceptLeader,
    /// Release the worker pools.
    Stop,
}

/// One entry of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Run in the old state.
    pub pre_actions: &'static [RaftAction],
    pub next: RaftState,
    /// Run in the new state.
    pub post_actions: &'static [RaftAction],
}

impl Transition {
    const fn new(
        pre_actions: &'static [RaftAction],
        next: RaftState,
        post_actions: &'static [RaftAction],
    ) -> Self {
        Self {
            pre_actions,
            next,
            post_actions,
        }
    }
}

/// Look up the transition for `event` in `state`.
///
/// `None` means the event was superseded (typically by an `AcceptLeader`
/// that was processed first) and must be discarded.
pub fn transition(state: RaftState, event: RaftEvent) -> Option<Transition> {
    use RaftAction as A;
    use RaftEvent as E;
    use RaftState as S;

    let t = match (state, event) {
        (S::Stranger, E::Init) => Transition::new(&[A::Init], S::Follower, &[A::PostFollower]),

        (S::Follower, E::PingTimeout) => Transition::new(
            &[A::RemoveFollowerScheduler],
            S::PreCandidate,
            &[A::ToPreCandidate],
        ),
        (S::Follower, E::AcceptLeader) => {
            Transition::new(&[A::AcceptLeader], S::Follower, &[A::PostFollower])
        }
        (S::Follower, E::Stop) => Transition::new(
            &[A::RemoveFollowerScheduler, A::Stop],
            S::Stranger,
            &[],
        ),

        (S::PreCandidate, E::PrevoteSuccess) => {
            Transition::new(&[], S::Candidate, &[A::PostCandidate])
        }
        (S::PreCandidate, E::PrevoteFailed) => {
            Transition::new(&[], S::Follower, &[A::PostFollower])
        }

        (S::Candidate, E::ToLeader) => Transition::new(&[], S::Leader, &[A::PostLeader]),
        (S::Candidate, E::VoteFailed) => Transition::new(&[], S::Follower, &[A::PostFollower]),

        (S::PreCandidate | S::Candidate, E::AcceptLeader) => {
            Transition::new(&[A::AcceptLeader], S::Follower, &[A::PostFollower])
        }
        (S::PreCandidate | S::Candidate, E::ForceFollower) => {
            Transition::new(&[], S::Follower, &[A::PostFollower])
        }
        (S::PreCandidate | S::Candidate, E::Stop) => {
            Transition::new(&[A::Stop], S::Stranger, &[])
        }

        (S::Leader, E::AcceptLeader) => Transition::new(
            &[A::RemoveLeaderScheduler, A::AcceptLeader],
            S::Follower,
            &[A::PostFollower],
        ),
        (S::Leader, E::NetworkPartition | E::ForceFollower) => Transition::new(
            &[A::RemoveLeaderScheduler],
            S::Follower,
            &[A::PostFollower],
        ),
        (S::Leader, E::Stop) => Transition::new(
            &[A::RemoveLeaderScheduler, A::Stop],
            S::Stranger,
            &[],
        ),

        _ => return None,
    };
    Some(t)
}

/// Context an event was published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventParams {
    /// Term the event was generated in. Events older than the node's
    /// current term are dropped.
    pub term: Term,
    /// Leader announced by an `AcceptLeader` event.
    pub leader_id: Option<NodeId>,
}

impl EventParams {
    pub fn at(term: Term) -> Self {
        Self {
            term,
            leader_id: None,
        }
    }

    /// Params that survive any term change. Used by `ForceFollower` and `Stop`.
    pub fn unconditional() -> Self {
        Self::at(Term::MAX)
    }

    pub fn leader(term: Term, leader_id: NodeId) -> Self {
        Self {
            term,
            leader_id: Some(leader_id),
        }
    }
}

/// Side effects of the transition table.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn current_term(&self) -> Term;

    async fn execute(
        &self,
        action: RaftAction,
        event: RaftEvent,
        params: EventParams,
    ) -> Result<()>;
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Event queue plus the loop applying the transition table.
///
/// The loop is the only writer of the state. Construction spawns nothing;
/// [`start`](RaftMachine::start) does.
pub struct RaftMachine {
    node_id: NodeId,
    queue: Mutex<VecDeque<(RaftEvent, EventParams)>>,
    notify: Notify,
    state: watch::Sender<RaftState>,
    worker: Mutex<Option<Worker>>,
}

impl RaftMachine {
    pub fn new(node_id: NodeId) -> Self {
        let (state, _) = watch::channel(RaftState::Stranger);
        Self {
            node_id,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            state,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RaftState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() != RaftState::Stranger
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftState> {
        self.state.subscribe()
    }

    pub async fn publish(&self, event: RaftEvent, params: EventParams) {
        tracing::debug!(
            node_id = self.node_id,
            event = ?event,
            term = params.term,
            "Publishing event"
        );
        let mut queue = self.queue.lock().await;
        if event == RaftEvent::AcceptLeader {
            queue.push_front((event, params));
        } else {
            queue.push_back((event, params));
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Whether the event loop is alive, whatever the current state.
    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Spawn the event loop. Events left over from a previous run are dropped.
    /// Does nothing when the loop is already running.
    pub async fn start(self: &Arc<Self>, executor: Weak<dyn ActionExecutor>) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }
        self.queue.lock().await.clear();

        let token = CancellationToken::new();
        let machine = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { machine.run(executor, child).await });
        *worker = Some(Worker { token, handle });
    }

    /// Cancel the event loop and wait for it to exit.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                tracing::warn!(node_id = self.node_id, error = %e, "Event loop ended abnormally");
            }
        }
    }

    async fn run(self: Arc<Self>, executor: Weak<dyn ActionExecutor>, token: CancellationToken) {
        tracing::debug!(node_id = self.node_id, "Event loop started");
        loop {
            let next = self.queue.lock().await.pop_front();
            let Some((event, params)) = next else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.notify.notified() => continue,
                }
            };
            if token.is_cancelled() {
                break;
            }
            let Some(executor) = executor.upgrade() else {
                break;
            };
            self.apply(executor.as_ref(), event, params).await;
        }
        tracing::debug!(node_id = self.node_id, "Event loop stopped");
    }

    async fn apply(&self, executor: &dyn ActionExecutor, event: RaftEvent, params: EventParams) {
        let from = self.state();
        let Some(target) = transition(from, event) else {
            tracing::debug!(
                node_id = self.node_id,
                state = %from,
                event = ?event,
                "Ignoring event with no transition"
            );
            return;
        };

        let term = executor.current_term().await;
        if term > params.term {
            tracing::debug!(
                node_id = self.node_id,
                term,
                event_term = params.term,
                event = ?event,
                "Discarding stale event"
            );
            return;
        }

        self.run_actions(executor, target.pre_actions, event, params)
            .await;
        self.state.send_replace(target.next);
        if from != target.next {
            tracing::info!(
                node_id = self.node_id,
                term,
                from = %from,
                to = %target.next,
                event = ?event,
                "State transition"
            );
        }
        self.run_actions(executor, target.post_actions, event, params)
            .await;
    }

    async fn run_actions(
        &self,
        executor: &dyn ActionExecutor,
        actions: &[RaftAction],
        event: RaftEvent,
        params: EventParams,
    ) {
        for action in actions {
            tracing::trace!(
                node_id = self.node_id,
                action = ?action,
                event = ?event,
                "Running action"
            );
            if let Err(e) = executor.execute(*action, event, params).await {
                tracing::error!(
                    node_id = self.node_id,
                    state = %self.state(),
                    action = ?action,
                    event = ?event,
                    error = %e,
                    "Action failed"
                );
            }
        }
    }
}
