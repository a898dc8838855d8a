use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{self, Duration, Instant};

use super::log::LogManager;
use super::machine::{ActionExecutor, EventParams, RaftAction, RaftEvent, RaftMachine};
use super::meta::MetaDataManager;
use super::pool::WorkerPools;
use super::propose::ProposeHelper;
use super::roles;
use super::rpc::{
    AppendLogEntriesParam, AppendLogReply, PreVoteParam, RaftService, Reply,
    ReplicateSnapshotParam, RequestVoteParam,
};
use super::state::{is_log_up_to_date, HeartbeatState, LogEntry, RaftState, Snapshot};
use super::timer::Schedulers;
use super::{LogIndex, NodeId, Term};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::storage::{
    DataStorage, LogStorage, MemoryDataStorage, MemoryLogStorage, MemoryMetaStorage, MetaStorage,
};

/// How long `stop()` waits for the event loop to reach `Stranger`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// State guarded by the node-wide critical section.
struct NodeCore {
    meta: MetaDataManager,
    heartbeat: HeartbeatState,
    leader_id: Option<NodeId>,
    /// Term this node accepts proposals in. Set once the leader's pipelines
    /// are running, cleared before they stop.
    leading: Option<Term>,
}

/// Point-in-time view of a node, for tests and the demo binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: RaftState,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub committed_idx: LogIndex,
    pub applied_idx: LogIndex,
    pub last_log: (Term, LogIndex),
    /// Whether a leader has been heard from since the node started.
    pub stable: bool,
}

/// A Raft participant.
///
/// Role changes only happen on the [`RaftMachine`] event loop. RPC handlers
/// and role actions share one critical section (`core`) for term, vote,
/// heartbeat and leader bookkeeping; state machine application is serialized
/// separately by `apply_lock`.
pub struct Node {
    id: NodeId,
    pub(crate) config: RaftConfig,
    me: Weak<Node>,
    core: Mutex<NodeCore>,
    committed_idx: AtomicU64,
    stable: AtomicBool,
    priority: AtomicU64,
    peers: RwLock<Vec<Arc<dyn RaftService>>>,
    machine: Arc<RaftMachine>,
    pub(crate) log: LogManager,
    data: Arc<dyn DataStorage>,
    apply_lock: Mutex<()>,
    pub(crate) schedulers: Schedulers,
    pub(crate) pools: WorkerPools,
    pub(crate) propose_helper: ProposeHelper,
    lifecycle: Mutex<()>,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        meta: Arc<dyn MetaStorage>,
        log: Arc<dyn LogStorage>,
        data: Arc<dyn DataStorage>,
    ) -> Arc<Self> {
        let log = LogManager::new(log, config.log.clone());
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            core: Mutex::new(NodeCore {
                meta: MetaDataManager::new(meta),
                heartbeat: HeartbeatState::default(),
                leader_id: None,
                leading: None,
            }),
            committed_idx: AtomicU64::new(0),
            stable: AtomicBool::new(false),
            priority: AtomicU64::new(0),
            peers: RwLock::new(Vec::new()),
            machine: Arc::new(RaftMachine::new(id)),
            log,
            data,
            apply_lock: Mutex::new(()),
            schedulers: Schedulers::new(),
            pools: WorkerPools::new(),
            propose_helper: ProposeHelper::new(),
            lifecycle: Mutex::new(()),
            config,
        })
    }

    /// A node backed by fresh in-memory storages.
    pub fn in_memory(id: NodeId, config: RaftConfig) -> Arc<Self> {
        Self::new(
            id,
            config,
            Arc::new(MemoryMetaStorage::new()),
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryDataStorage::new()),
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> RaftState {
        self.machine.state()
    }

    pub fn is_ready(&self) -> bool {
        self.machine.is_ready()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == RaftState::Leader
    }

    /// Whether this node is leader and its pipelines are running, so that
    /// proposals are accepted.
    pub async fn is_leading(&self) -> bool {
        let core = self.core.lock().await;
        core.leading == Some(core.meta.term())
    }

    /// Watch role changes.
    pub fn subscribe(&self) -> watch::Receiver<RaftState> {
        self.machine.subscribe()
    }

    pub async fn term(&self) -> Term {
        self.core.lock().await.meta.term()
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.core.lock().await.leader_id
    }

    pub fn committed_idx(&self) -> LogIndex {
        self.committed_idx.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn is_stable(&self) -> bool {
        self.stable.load(Ordering::Acquire)
    }

    pub async fn applied_idx(&self) -> LogIndex {
        self.data.apply_idx().await
    }

    /// Every log entry still held, lowest index first.
    pub async fn logs(&self) -> Result<Vec<LogEntry>> {
        self.log.entries().await
    }

    pub async fn status(&self) -> NodeStatus {
        let (term, voted_for, leader_id) = {
            let core = self.core.lock().await;
            (core.meta.term(), core.meta.voted_for(), core.leader_id)
        };
        NodeStatus {
            id: self.id,
            state: self.state(),
            term,
            voted_for,
            leader_id,
            committed_idx: self.committed_idx(),
            applied_idx: self.data.apply_idx().await,
            last_log: self.log.last_log().await,
            stable: self.is_stable(),
        }
    }

    /// Join the cluster formed by `peers`.
    ///
    /// Restores term, log and state machine from storage, then enters
    /// `Follower`. `priority` overrides the default election priority, which
    /// is this node's position among the sorted cluster ids. Calling `start`
    /// on a running node does nothing.
    pub async fn start(
        &self,
        peers: Vec<Arc<dyn RaftService>>,
        priority: Option<u64>,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.machine.is_running().await {
            return Ok(());
        }
        self.config.validate()?;

        let peers: Vec<Arc<dyn RaftService>> =
            peers.into_iter().filter(|p| p.id() != self.id).collect();
        let priority = priority.unwrap_or_else(|| {
            let mut ids: Vec<NodeId> = peers.iter().map(|p| p.id()).collect();
            ids.push(self.id);
            ids.sort_unstable();
            ids.dedup();
            ids.iter().position(|id| *id == self.id).unwrap_or_default() as u64
        });
        self.priority.store(priority, Ordering::Relaxed);
        let peer_count = peers.len();
        *self.peers.write().await = peers;

        self.load().await?;

        let me = self.me.upgrade().ok_or(RaftError::Shutdown)?;
        let executor: Arc<dyn ActionExecutor> = me;
        self.machine.start(Arc::downgrade(&executor)).await;

        let term = self.term().await;
        tracing::info!(
            node_id = self.id,
            term,
            priority,
            peers = peer_count,
            committed_idx = self.committed_idx(),
            "Starting node"
        );
        self.machine.publish(RaftEvent::Init, EventParams::at(term)).await;
        Ok(())
    }

    /// Restore durable state and replay the log into the state machine.
    async fn load(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.meta.init().await?;
        core.heartbeat = HeartbeatState::default();
        core.leader_id = None;
        core.leading = None;

        let _apply = self.apply_lock.lock().await;
        let apply_idx = self.data.load_snapshot().await?;
        let apply_term = self.data.get_snapshot().await?.apply_term;
        self.log.init(apply_idx, apply_term).await?;

        let (_, last) = self.log.last_log().await;
        let applied = self.apply_locked(last).await?;
        self.committed_idx.store(applied, Ordering::Release);
        self.stable.store(false, Ordering::Release);
        tracing::debug!(
            node_id = self.id,
            term = core.meta.term(),
            snapshot_idx = apply_idx,
            applied,
            "Restored node state"
        );
        Ok(())
    }

    /// Leave the cluster. Releases schedulers, pipelines and pools; storages
    /// keep their contents so the node can be started again.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.machine.is_running().await {
            return Ok(());
        }

        if self.machine.is_ready() {
            let mut states = self.machine.subscribe();
            self.machine
                .publish(RaftEvent::Stop, EventParams::unconditional())
                .await;
            let stopped = time::timeout(
                STOP_TIMEOUT,
                states.wait_for(|s| *s == RaftState::Stranger),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            if !stopped {
                tracing::warn!(node_id = self.id, "Timed out waiting for the node to stop");
            }
        }
        self.machine.stop().await;

        // Covers a loop that was cancelled before it could run STOP
        self.end_leading().await;
        self.schedulers.clear_all().await;
        self.propose_helper.clear().await;
        self.pools.set_cluster_pool(None).await;
        self.pools.set_api_pool(None).await;

        tracing::info!(node_id = self.id, "Node stopped");
        Ok(())
    }

    /// Replicate `command` and apply it to the local state machine.
    ///
    /// Returns the entry's index once a majority holds it and it has been
    /// applied here. Only a leader whose pipelines are running accepts
    /// proposals; other nodes answer [`RaftError::NotLeader`] with the leader
    /// they know of, and nothing is written to the log. Once the entry is
    /// written, failures are reported as [`RaftError::ProposeFailed`]: the
    /// entry may still be committed later.
    pub async fn propose(&self, command: impl Into<String>) -> Result<LogIndex> {
        self.ensure_ready()?;
        let pool = self.pools.api_pool().await?;
        let followers = self.peers.read().await.len();

        // Index allocation and apply-order registration happen under `core`,
        // so they line up and never outlive the leadership they belong to
        let (entry, turn) = {
            let core = self.core.lock().await;
            let term = core.meta.term();
            if core.leading != Some(term) {
                return Err(RaftError::NotLeader(core.leader_id.filter(|id| *id != self.id)));
            }
            let entry = self.log.create_log(term, command).await?;
            let turn = self.propose_helper.register(entry.index);
            (entry, turn)
        };
        let index = entry.index;
        tracing::debug!(node_id = self.id, term = entry.term, index, "Proposing entry");

        let timeout = self.config.rpc_timeout();
        self.propose_helper
            .propose(turn, &pool, timeout, followers, entry, || async move {
                self.committed_idx.fetch_max(index, Ordering::AcqRel);
                self.apply_up_to(index).await
            })
            .await
    }

    /// Snapshot the state machine and drop the log entries it covers.
    pub async fn take_snapshot(&self) -> Result<LogIndex> {
        if !self.is_ready() {
            return Err(RaftError::NotReady);
        }
        let _apply = self.apply_lock.lock().await;
        let snapshot = self.data.get_snapshot().await?;
        self.data
            .save_snapshot(snapshot.apply_term, snapshot.apply_idx, &snapshot.data)
            .await?;
        self.log.compact(snapshot.apply_idx).await?;
        tracing::info!(
            node_id = self.id,
            apply_idx = snapshot.apply_idx,
            apply_term = snapshot.apply_term,
            "Took snapshot"
        );
        Ok(snapshot.apply_idx)
    }

    pub(crate) fn handle(&self) -> Weak<Node> {
        self.me.clone()
    }

    pub(crate) async fn peers(&self) -> Vec<Arc<dyn RaftService>> {
        self.peers.read().await.clone()
    }

    pub(crate) async fn publish(&self, event: RaftEvent, params: EventParams) {
        self.machine.publish(event, params).await;
    }

    /// Adopt a newer term seen in a reply and fall back to follower.
    ///
    /// Information about a term older than the current one is ignored.
    pub(crate) async fn step_down(&self, term: Term) {
        let current = {
            let mut core = self.core.lock().await;
            match core.meta.accept_higher_term(term).await {
                Ok(true) => core.leader_id = None,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(node_id = self.id, term, error = %e, "Could not persist term");
                    return;
                }
            }
            core.meta.term()
        };
        if current == term {
            self.force_follower().await;
        }
    }

    /// Demote an active non-follower role.
    async fn force_follower(&self) {
        if matches!(
            self.state(),
            RaftState::PreCandidate | RaftState::Candidate | RaftState::Leader
        ) {
            self.machine
                .publish(RaftEvent::ForceFollower, EventParams::unconditional())
                .await;
        }
    }

    /// Bump the term from `origin` and vote for ourselves. `None` when the
    /// term moved on meanwhile.
    pub(crate) async fn increase_term(&self, origin: Term) -> Result<Option<Term>> {
        let mut core = self.core.lock().await;
        let next = core.meta.increase_term(origin, self.id).await?;
        if next.is_some() {
            core.leader_id = None;
        }
        Ok(next)
    }

    pub(crate) async fn accept_leader(&self, term: Term, leader_id: Option<NodeId>) -> Result<()> {
        let mut core = self.core.lock().await;
        core.meta.accept_higher_term(term).await?;
        if leader_id.is_some() {
            core.leader_id = leader_id;
        }
        Ok(())
    }

    /// Open for proposals in `term`, unless the term already moved on.
    pub(crate) async fn begin_leading(&self, term: Term) -> bool {
        let mut core = self.core.lock().await;
        if core.meta.term() != term {
            return false;
        }
        core.leading = Some(term);
        true
    }

    pub(crate) async fn end_leading(&self) {
        self.core.lock().await.leading = None;
    }

    pub(crate) async fn set_leader(&self, leader_id: NodeId) {
        self.core.lock().await.leader_id = Some(leader_id);
    }

    /// The current term if no heartbeat arrived within `timeout` of
    /// `since` or of the last heartbeat, whichever is later.
    pub(crate) async fn heartbeat_expired(
        &self,
        since: Instant,
        timeout: Duration,
    ) -> Option<Term> {
        let core = self.core.lock().await;
        let last = core
            .heartbeat
            .last_heartbeat_at()
            .map_or(since, |at| at.max(since));
        (last.elapsed() > timeout).then(|| core.meta.term())
    }

    /// Move the commit index to the highest entry of the current term that
    /// a majority holds.
    pub(crate) async fn advance_commit(&self) {
        if self.state() != RaftState::Leader {
            return;
        }
        let followers = self.peers.read().await.len();
        let mut matched: Vec<LogIndex> = self
            .propose_helper
            .match_indexes()
            .await
            .into_iter()
            .map(|(_, idx)| idx)
            .collect();
        if matched.len() != followers {
            return;
        }
        matched.push(self.log.last_log().await.1);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[matched.len() / 2];
        if candidate <= self.committed_idx() {
            return;
        }

        let term = self.term().await;
        match self.log.term_at(candidate).await {
            Ok(Some(t)) if t == term => {
                let previous = self.committed_idx.fetch_max(candidate, Ordering::AcqRel);
                if previous < candidate {
                    tracing::trace!(
                        node_id = self.id,
                        term,
                        committed_idx = candidate,
                        "Commit index advanced"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    node_id = self.id,
                    index = candidate,
                    error = %e,
                    "Could not read log term"
                );
            }
        }
    }

    pub(crate) async fn snapshot_for_replication(&self) -> Result<Snapshot> {
        let _apply = self.apply_lock.lock().await;
        self.data.get_snapshot().await
    }

    /// Apply every entry up to `index` that the state machine has not seen.
    pub(crate) async fn apply_up_to(&self, index: LogIndex) -> Result<()> {
        let _apply = self.apply_lock.lock().await;
        self.apply_locked(index).await?;
        Ok(())
    }

    /// Caller holds `apply_lock`. Returns the new applied index.
    async fn apply_locked(&self, index: LogIndex) -> Result<LogIndex> {
        let mut applied = self.data.apply_idx().await;
        while applied < index {
            let next = applied + 1;
            let Some(entry) = self.log.get_log(next).await? else {
                tracing::warn!(node_id = self.id, index = next, "Entry to apply is missing");
                break;
            };
            self.data.apply(entry.term, entry.index, &entry.command).await?;
            applied = next;
        }
        Ok(applied)
    }

    /// Follow the leader's commit index up to the heartbeat's anchor entry,
    /// provided we hold that exact entry.
    async fn commit_from_heartbeat(&self, param: &AppendLogEntriesParam) -> Result<()> {
        let target = param.commit_idx.min(param.pre_log_idx);
        if target <= self.committed_idx() || param.pre_log_idx < self.log.horizon().await {
            return Ok(());
        }
        if self.log.term_at(param.pre_log_idx).await? != Some(param.pre_log_term) {
            return Ok(());
        }
        self.committed_idx.fetch_max(target, Ordering::AcqRel);
        self.apply_up_to(target).await
    }

    /// Where the leader should resume when our log does not hold the entry
    /// `(pre_log_term, pre_log_idx)`. `None` when it does.
    ///
    /// A short log answers with its last index. A conflicting entry rewinds
    /// by `repair_length`. Entries below the horizon are committed and
    /// always match.
    async fn compare_hint(
        &self,
        pre_log_term: Term,
        pre_log_idx: LogIndex,
    ) -> Result<Option<LogIndex>> {
        let (_, last) = self.log.last_log().await;
        if last < pre_log_idx {
            return Ok(Some(last));
        }
        if pre_log_idx < self.log.horizon().await
            || self.log.term_at(pre_log_idx).await? == Some(pre_log_term)
        {
            return Ok(None);
        }
        let rewind = last.min(pre_log_idx).saturating_sub(self.config.repair_length);
        tracing::debug!(
            node_id = self.id,
            pre_log_idx,
            compare_idx = rewind,
            "Log mismatch, asking leader to rewind"
        );
        Ok(Some(rewind))
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RaftError::NotReady)
        }
    }
}

#[async_trait]
impl ActionExecutor for Node {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn current_term(&self) -> Term {
        self.term().await
    }

    async fn execute(
        &self,
        action: RaftAction,
        _event: RaftEvent,
        params: EventParams,
    ) -> Result<()> {
        match action {
            RaftAction::Init => roles::follower::init(self).await,
            RaftAction::PostFollower => roles::follower::start_timeout_scheduler(self).await,
            RaftAction::RemoveFollowerScheduler => {
                self.schedulers.clear_timeout_scheduler().await;
                Ok(())
            }
            RaftAction::ToPreCandidate => roles::pre_candidate::pre_vote(self, params).await,
            RaftAction::PostCandidate => roles::candidate::request_votes(self, params).await,
            RaftAction::PostLeader => roles::leader::init(self).await,
            RaftAction::RemoveLeaderScheduler => roles::leader::stop(self).await,
            RaftAction::AcceptLeader => self.accept_leader(params.term, params.leader_id).await,
            RaftAction::Stop => roles::release(self).await,
        }
    }
}

#[async_trait]
impl RaftService for Node {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn pre_vote(&self, param: PreVoteParam) -> Result<Reply> {
        self.ensure_ready()?;
        let core = self.core.lock().await;
        let term = core.meta.term();
        if param.term < term {
            return Ok(Reply::reject(term));
        }
        if self.state() == RaftState::Leader {
            return Ok(Reply::reject(term));
        }
        if !is_log_up_to_date(self.log.last_log().await, param.last_log_term, param.last_log_idx) {
            return Ok(Reply::reject(term));
        }
        if core.heartbeat.heard_within(self.config.base_timeout()) {
            tracing::debug!(
                node_id = self.id,
                candidate = param.node_id,
                "Leader still alive, refusing pre-vote"
            );
            return Ok(Reply::reject(term));
        }
        Ok(Reply::accept(term))
    }

    async fn request_vote(&self, param: RequestVoteParam) -> Result<Reply> {
        self.ensure_ready()?;
        let mut core = self.core.lock().await;
        let term = core.meta.term();
        if param.term < term {
            return Ok(Reply::reject(term));
        }
        if param.term > term {
            core.meta.accept_higher_term(param.term).await?;
            core.leader_id = None;
            self.force_follower().await;
        }
        if !is_log_up_to_date(self.log.last_log().await, param.last_log_term, param.last_log_idx) {
            return Ok(Reply::reject(param.term));
        }
        if !core.meta.vote_for(param.term, param.node_id).await? {
            return Ok(Reply::reject(param.term));
        }
        core.heartbeat.set(param.term, Instant::now());
        tracing::info!(
            node_id = self.id,
            term = param.term,
            candidate = param.node_id,
            "Granted vote"
        );
        Ok(Reply::accept(param.term))
    }

    async fn append_log_entries(&self, param: AppendLogEntriesParam) -> Result<AppendLogReply> {
        self.ensure_ready()?;
        let mut core = self.core.lock().await;
        let term = core.meta.term();
        if param.term < term {
            return Ok(AppendLogReply::reject(term));
        }
        core.meta.accept_higher_term(param.term).await?;
        if core.leader_id != Some(param.node_id) {
            tracing::info!(
                node_id = self.id,
                term = param.term,
                leader_id = param.node_id,
                "Following leader"
            );
        }
        core.leader_id = Some(param.node_id);
        if self.state() != RaftState::Follower {
            self.machine
                .publish(RaftEvent::AcceptLeader, EventParams::leader(param.term, param.node_id))
                .await;
        }
        core.heartbeat.set(param.term, Instant::now());
        self.stable.store(true, Ordering::Release);

        if param.is_heartbeat() {
            self.commit_from_heartbeat(&param).await?;
            // Still a success: a lagging follower acknowledges the leader too
            let mut reply = AppendLogReply::accept(param.term);
            reply.compare_idx = self.compare_hint(param.pre_log_term, param.pre_log_idx).await?;
            return Ok(reply);
        }

        let committed = self.committed_idx();
        if committed > param.commit_idx {
            // We hold committed entries the leader is missing
            return Ok(AppendLogReply::request_snapshot(param.term));
        }

        if let Some(compare_idx) = self.compare_hint(param.pre_log_term, param.pre_log_idx).await? {
            return Ok(AppendLogReply::repair_from(param.term, compare_idx));
        }
        if param.logs.first().map(|e| e.index) != Some(param.pre_log_idx + 1) {
            return Ok(AppendLogReply::reject(param.term));
        }

        for entry in &param.logs {
            self.log.append_log(entry).await?;
        }
        let appended = param.pre_log_idx + param.logs.len() as LogIndex;
        let target = param.commit_idx.min(appended);
        self.committed_idx.fetch_max(target, Ordering::AcqRel);
        self.apply_up_to(self.committed_idx()).await?;
        Ok(AppendLogReply::accept(param.term))
    }

    async fn replicate_snapshot(&self, param: ReplicateSnapshotParam) -> Result<Reply> {
        self.ensure_ready()?;
        let mut core = self.core.lock().await;
        let term = core.meta.term();
        if param.term < term {
            return Ok(Reply::reject(term));
        }
        core.meta.accept_higher_term(param.term).await?;
        core.leader_id = Some(param.node_id);
        if self.state() != RaftState::Follower {
            self.machine
                .publish(RaftEvent::AcceptLeader, EventParams::leader(param.term, param.node_id))
                .await;
        }
        core.heartbeat.set(param.term, Instant::now());
        self.stable.store(true, Ordering::Release);

        let _apply = self.apply_lock.lock().await;
        self.data
            .save_snapshot(param.apply_term, param.apply_idx, &param.data)
            .await?;
        self.log.reset_to(param.apply_idx, param.apply_term).await?;
        self.committed_idx.store(param.apply_idx, Ordering::Release);
        tracing::info!(
            node_id = self.id,
            term = param.term,
            apply_idx = param.apply_idx,
            "Installed snapshot from leader"
        );
        Ok(Reply::accept(param.term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(20)
            .with_timeouts(80, 20, 10)
            .with_tick_interval(5)
            .with_rpc_timeout(100)
    }

    async fn wait_for_state(node: &Node, state: RaftState) {
        let mut states = node.subscribe();
        time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn wait_until_leading(node: &Node) {
        let leading = async {
            while !node.is_leading().await {
                time::sleep(Duration::from_millis(5)).await;
            }
        };
        time::timeout(Duration::from_secs(2), leading)
            .await
            .expect("leadership not taken");
    }

    fn append(
        term: Term,
        pre: (Term, LogIndex),
        commit_idx: LogIndex,
        logs: Vec<LogEntry>,
    ) -> AppendLogEntriesParam {
        AppendLogEntriesParam {
            node_id: 2,
            term,
            pre_log_term: pre.0,
            pre_log_idx: pre.1,
            commit_idx,
            logs,
        }
    }

    /// A node with a silent peer, so it stays a follower as long as the
    /// test keeps feeding it heartbeats.
    async fn follower() -> Arc<Node> {
        let node = Node::in_memory(1, config().with_timeouts(2_000, 10, 10));
        let silent = Node::in_memory(2, config());
        node.start(vec![silent as Arc<dyn RaftService>], Some(0)).await.unwrap();
        wait_for_state(&node, RaftState::Follower).await;
        node
    }

    #[tokio::test]
    async fn test_rpcs_refused_before_start() {
        let node = Node::in_memory(1, config());
        let err = node.pre_vote(PreVoteParam {
            node_id: 2,
            term: 1,
            last_log_term: 0,
            last_log_idx: 0,
        })
        .await
        .unwrap_err();
        assert_eq!(err, RaftError::NotReady);
        assert_eq!(node.propose("x").await, Err(RaftError::NotReady));
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_applies() {
        let node = Node::in_memory(1, config());
        node.start(Vec::new(), None).await.unwrap();
        wait_until_leading(&node).await;

        assert_eq!(node.propose("a").await, Ok(1));
        assert_eq!(node.propose("b").await, Ok(2));

        let status = node.status().await;
        assert_eq!(status.term, 1);
        assert_eq!(status.voted_for, Some(1));
        assert_eq!(status.leader_id, Some(1));
        assert_eq!(status.committed_idx, 2);
        assert_eq!(status.applied_idx, 2);

        node.stop().await.unwrap();
        assert_eq!(node.state(), RaftState::Stranger);
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let node = follower().await;
        let reply = node.append_log_entries(append(3, (0, 0), 0, Vec::new())).await.unwrap();
        assert!(reply.success);
        assert_eq!(node.propose("x").await, Err(RaftError::NotLeader(Some(2))));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_deposed_leader_writes_nothing() {
        let node = Node::in_memory(1, config());
        node.start(Vec::new(), None).await.unwrap();
        wait_until_leading(&node).await;
        assert_eq!(node.propose("a").await, Ok(1));

        // A newer leader shows up; proposals stop before the role change lands
        let reply = node.append_log_entries(append(2, (1, 1), 1, Vec::new())).await.unwrap();
        assert!(reply.success);
        assert!(!node.is_leading().await);
        assert_eq!(node.propose("b").await, Err(RaftError::NotLeader(Some(2))));

        let logs = node.logs().await.unwrap();
        assert_eq!(logs.last().unwrap().index, 1);
        assert!(logs.iter().all(|e| e.command != "b"));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_vote_grants_once_per_term() {
        let node = follower().await;
        let vote = |candidate: NodeId, term: Term| RequestVoteParam {
            node_id: candidate,
            term,
            last_log_term: 0,
            last_log_idx: 0,
        };

        assert!(node.request_vote(vote(2, 4)).await.unwrap().success);
        assert!(node.request_vote(vote(2, 4)).await.unwrap().success);
        assert!(!node.request_vote(vote(3, 4)).await.unwrap().success);

        let stale = node.request_vote(vote(3, 3)).await.unwrap();
        assert!(!stale.success);
        assert_eq!(stale.term, 4);

        // A newer term clears the old vote
        assert!(node.request_vote(vote(3, 5)).await.unwrap().success);
        let status = node.status().await;
        assert_eq!(status.term, 5);
        assert_eq!(status.voted_for, Some(3));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pre_vote_refused_while_leader_is_alive() {
        let node = follower().await;
        let param = PreVoteParam {
            node_id: 3,
            term: 1,
            last_log_term: 0,
            last_log_idx: 0,
        };
        assert!(node.pre_vote(param.clone()).await.unwrap().success);

        node.append_log_entries(append(1, (0, 0), 0, Vec::new())).await.unwrap();
        assert!(!node.pre_vote(param).await.unwrap().success);
        // Pre-votes never change the term
        assert_eq!(node.term().await, 1);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pre_vote_checks_log_even_for_higher_terms() {
        let node = Node::in_memory(1, config().with_timeouts(50, 10, 10));
        let silent = Node::in_memory(2, config());
        node.start(vec![silent as Arc<dyn RaftService>], Some(0)).await.unwrap();
        wait_for_state(&node, RaftState::Follower).await;
        let entries = vec![LogEntry::new(1, 1, "a"), LogEntry::new(2, 1, "b")];
        assert!(node.append_log_entries(append(1, (0, 0), 0, entries)).await.unwrap().success);
        // Let the leader's lease run out
        time::sleep(Duration::from_millis(120)).await;

        let poll = |last_log_idx: LogIndex| PreVoteParam {
            node_id: 3,
            term: 100,
            last_log_term: 1,
            last_log_idx,
        };
        assert!(!node.pre_vote(poll(1)).await.unwrap().success, "Shorter log");
        assert!(node.pre_vote(poll(2)).await.unwrap().success);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_checks_previous_entry() {
        let node = follower().await;
        let entries = vec![LogEntry::new(1, 1, "a"), LogEntry::new(2, 1, "b")];
        assert!(node.append_log_entries(append(1, (0, 0), 0, entries)).await.unwrap().success);

        // Gap: we only hold up to 2
        let reply = node
            .append_log_entries(append(1, (1, 5), 0, vec![LogEntry::new(6, 1, "f")]))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.compare_idx, Some(2));

        // Term mismatch at 2: rewind by repair_length, floored at 0
        let reply = node
            .append_log_entries(append(2, (2, 2), 0, vec![LogEntry::new(3, 2, "c")]))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.compare_idx, Some(0));

        // Conflicting suffix is replaced
        let reply = node
            .append_log_entries(append(2, (1, 1), 2, vec![LogEntry::new(2, 2, "b2")]))
            .await
            .unwrap();
        assert!(reply.success);
        let logs = node.logs().await.unwrap();
        assert_eq!(logs.last().unwrap(), &LogEntry::new(2, 2, "b2"));
        assert_eq!(node.committed_idx(), 2);
        assert_eq!(node.applied_idx().await, 2);

        // A heartbeat anchored past our log is accepted and says where we stand
        let reply = node.append_log_entries(append(2, (2, 4), 4, Vec::new())).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.compare_idx, Some(2));
        assert_eq!(node.committed_idx(), 2);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_from_stale_leader_is_rejected() {
        let node = follower().await;
        node.append_log_entries(append(5, (0, 0), 0, Vec::new())).await.unwrap();
        let reply = node
            .append_log_entries(append(4, (0, 0), 0, vec![LogEntry::new(1, 4, "x")]))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        assert!(node.logs().await.unwrap().iter().all(|e| e.index == 0));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_ahead_in_commits_requests_snapshot() {
        let node = follower().await;
        let entries = vec![LogEntry::new(1, 1, "a"), LogEntry::new(2, 1, "b")];
        node.append_log_entries(append(1, (0, 0), 2, entries)).await.unwrap();
        assert_eq!(node.committed_idx(), 2);

        let reply = node
            .append_log_entries(append(2, (1, 1), 1, vec![LogEntry::new(2, 2, "z")]))
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.sync_snapshot);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_replicate_snapshot_resets_log() {
        let node = follower().await;
        let data = serde_json::to_vec(&vec!["a", "b", "c"]).unwrap();
        let reply = node
            .replicate_snapshot(ReplicateSnapshotParam {
                node_id: 2,
                term: 2,
                apply_idx: 3,
                apply_term: 2,
                data,
            })
            .await
            .unwrap();
        assert!(reply.success);

        let status = node.status().await;
        assert_eq!(status.committed_idx, 3);
        assert_eq!(status.applied_idx, 3);
        assert_eq!(status.last_log, (2, 3));
        assert_eq!(status.leader_id, Some(2));

        // Entries continue right after the snapshot
        let reply = node
            .append_log_entries(append(2, (2, 3), 4, vec![LogEntry::new(4, 2, "d")]))
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(node.applied_idx().await, 4);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_log() {
        let meta = Arc::new(MemoryMetaStorage::new());
        let log = Arc::new(MemoryLogStorage::new());
        let data = Arc::new(MemoryDataStorage::new());
        let node = Node::new(1, config(), meta, log, data.clone());

        node.start(Vec::new(), None).await.unwrap();
        wait_until_leading(&node).await;
        node.propose("a").await.unwrap();
        node.propose("b").await.unwrap();
        node.take_snapshot().await.unwrap();
        node.propose("c").await.unwrap();
        node.stop().await.unwrap();

        node.start(Vec::new(), None).await.unwrap();
        wait_until_leading(&node).await;
        let status = node.status().await;
        assert_eq!(status.term, 2);
        assert_eq!(status.applied_idx, 3);
        assert_eq!(status.last_log.1, 3);
        assert_eq!(data.commands().await, vec!["a", "b", "c"]);
        node.stop().await.unwrap();
    }
}
