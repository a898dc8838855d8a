use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use super::node::Node;
use super::rpc::{AppendLogEntriesParam, AppendLogReply, RaftService, ReplicateSnapshotParam};
use super::state::LogEntry;
use super::{LogIndex, NodeId, Term};
use crate::error::{RaftError, Result};

/// Queued entries past which those nobody waits for anymore are dropped.
/// The pipeline reads them back from the log once it reaches the gap.
const MAX_PENDING: usize = 4096;

struct Pending {
    entry: LogEntry,
    /// `None` for entries pulled back from the log during repair.
    waiter: Option<oneshot::Sender<AppendLogReply>>,
}

/// What the pipeline does after a rejected batch.
enum Recovery {
    /// Resume after this index.
    Resume(LogIndex),
    /// Ship the full snapshot first.
    Snapshot,
    /// Back off and retry the same batch.
    Retry,
}

/// Leader-side replication pipeline for one follower.
///
/// Proposers enqueue entries through [`append_log`](NodeProxy::append_log)
/// and wait for the outcome. A single task ships them strictly in index
/// order: `pre_log_idx` is a local of that task and nothing else touches it.
pub struct NodeProxy {
    leader: Weak<Node>,
    follower: Arc<dyn RaftService>,
    /// Term the leadership was won in. A stale pipeline keeps using it and is
    /// rejected by followers that moved on.
    term: Term,
    max_batch: usize,
    idle: Duration,
    pending: Mutex<BTreeMap<LogIndex, Pending>>,
    wake: Notify,
    /// Highest index the follower confirmed to hold.
    matched: AtomicU64,
    /// Lowest resume point reported by heartbeats since the last batch.
    rewind: Mutex<Option<LogIndex>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NodeProxy {
    pub fn new(
        leader: Weak<Node>,
        follower: Arc<dyn RaftService>,
        term: Term,
        max_batch: usize,
        idle: Duration,
    ) -> Self {
        Self {
            leader,
            follower,
            term,
            max_batch: max_batch.max(1),
            idle,
            pending: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            matched: AtomicU64::new(0),
            rewind: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.follower.id()
    }

    pub fn matched(&self) -> LogIndex {
        self.matched.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Spawn the pipeline, assuming the follower already holds everything up
    /// to `pre_log_idx`. Mismatches are found and repaired on the first batch.
    pub fn start(self: &Arc<Self>, pre_log_idx: LogIndex) {
        let token = CancellationToken::new();
        let proxy = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { proxy.run(pre_log_idx, child).await });
        let previous = self.lock_worker().replace((token, handle));
        if let Some((token, _)) = previous {
            token.cancel();
        }
    }

    /// Stop the pipeline and wait for it. Proposers still waiting get an error.
    pub async fn stop(&self) {
        let worker = self.lock_worker().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(
                    peer_id = self.id(),
                    error = %e,
                    "Replication pipeline ended abnormally"
                );
            }
        }
        self.lock_pending().clear();
        self.lock_rewind().take();
    }

    /// Resume after `compare_idx` on the next turn of the loop. Heartbeat
    /// replies use this for followers that lag behind or diverge while no
    /// entries are being shipped to them.
    pub fn rewind(&self, compare_idx: LogIndex) {
        let mut rewind = self.lock_rewind();
        *rewind = Some(rewind.map_or(compare_idx, |idx| idx.min(compare_idx)));
        drop(rewind);
        self.wake.notify_one();
    }

    /// Queue `entry` for this follower and wait for the pipeline's verdict.
    pub async fn append_log(&self, entry: LogEntry) -> Result<AppendLogReply> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(entry, Some(tx));
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    fn enqueue(&self, entry: LogEntry, waiter: Option<oneshot::Sender<AppendLogReply>>) {
        let mut pending = self.lock_pending();
        if waiter.is_some() && pending.len() >= MAX_PENDING {
            let before = pending.len();
            pending.retain(|_, p| p.waiter.as_ref().is_some_and(|w| !w.is_closed()));
            tracing::debug!(
                peer_id = self.id(),
                dropped = before - pending.len(),
                "Pending queue full, dropped entries without waiters"
            );
        }
        match pending.entry(entry.index) {
            Entry::Vacant(slot) => {
                slot.insert(Pending { entry, waiter });
            }
            Entry::Occupied(mut slot) => {
                if waiter.is_some() {
                    *slot.get_mut() = Pending { entry, waiter };
                }
            }
        }
        drop(pending);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>, mut pre_log_idx: LogIndex, token: CancellationToken) {
        tracing::debug!(
            peer_id = self.id(),
            term = self.term,
            pre_log_idx,
            "Replication pipeline started"
        );
        loop {
            if token.is_cancelled() {
                break;
            }
            let hint = self.lock_rewind().take().filter(|idx| *idx < pre_log_idx);
            if let Some(idx) = hint {
                let Some(node) = self.leader.upgrade() else {
                    break;
                };
                tracing::debug!(
                    peer_id = self.id(),
                    pre_log_idx,
                    compare_idx = idx,
                    "Follower behind, rewinding"
                );
                let recovery = Self::resume_at(&node, idx).await;
                if let Some(idx) = self.recover(&node, recovery).await {
                    pre_log_idx = idx;
                }
                continue;
            }

            let batch = self.poll_successive(pre_log_idx);
            if batch.is_empty() {
                if self.has_gap(pre_log_idx) {
                    let Some(node) = self.leader.upgrade() else {
                        break;
                    };
                    match self.realign(&node, pre_log_idx).await {
                        Ok(refilled) if refilled > 0 => continue,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(peer_id = self.id(), error = %e, "Could not refill gap");
                        }
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = time::sleep(self.idle) => {}
                }
                continue;
            }
            let Some(node) = self.leader.upgrade() else {
                break;
            };

            let sent = tokio::select! {
                _ = token.cancelled() => None,
                sent = self.ship(&node, pre_log_idx, &batch) => Some(sent),
            };
            let Some(sent) = sent else {
                self.put_back(batch);
                break;
            };

            let recovery = match sent {
                Ok(reply) if reply.success => {
                    pre_log_idx = self.handle_success(&node, batch, reply).await;
                    continue;
                }
                Ok(reply) if reply.term > self.term => {
                    tracing::info!(
                        peer_id = self.id(),
                        term = self.term,
                        peer_term = reply.term,
                        "Follower has a higher term, stepping down"
                    );
                    Self::resolve(batch, reply);
                    node.step_down(reply.term).await;
                    Recovery::Retry
                }
                Ok(reply) if reply.sync_snapshot => {
                    self.put_back(batch);
                    Recovery::Snapshot
                }
                Ok(reply) => {
                    self.put_back(batch);
                    match reply.compare_idx {
                        Some(idx) => Self::resume_at(&node, idx).await,
                        None => Recovery::Retry,
                    }
                }
                Err(e) => {
                    tracing::debug!(peer_id = self.id(), error = %e, "Append failed, will retry");
                    self.put_back(batch);
                    Recovery::Retry
                }
            };

            match self.recover(&node, recovery).await {
                Some(idx) => pre_log_idx = idx,
                None => {
                    drop(node);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = time::sleep(self.idle) => {}
                    }
                }
            }
        }
        tracing::debug!(peer_id = self.id(), "Replication pipeline stopped");
    }

    /// Resuming below the leader's horizon needs a snapshot first.
    async fn resume_at(node: &Node, compare_idx: LogIndex) -> Recovery {
        if compare_idx < node.log.horizon().await {
            Recovery::Snapshot
        } else {
            Recovery::Resume(compare_idx)
        }
    }

    /// Carry out `recovery`. Returns the new `pre_log_idx`, or `None` when
    /// the batch should simply be retried later.
    async fn recover(&self, node: &Node, recovery: Recovery) -> Option<LogIndex> {
        let recovery = match recovery {
            Recovery::Snapshot => match self.sync_snapshot(node).await {
                Ok(idx) => Recovery::Resume(idx),
                Err(e) => {
                    tracing::warn!(peer_id = self.id(), error = %e, "Snapshot replication failed");
                    Recovery::Retry
                }
            },
            other => other,
        };
        match recovery {
            Recovery::Resume(idx) => {
                if let Err(e) = self.realign(node, idx).await {
                    tracing::warn!(
                        peer_id = self.id(),
                        error = %e,
                        "Could not load entries for repair"
                    );
                }
                Some(idx)
            }
            _ => None,
        }
    }

    /// Whether pending entries exist that do not directly follow `pre_log_idx`.
    fn has_gap(&self, pre_log_idx: LogIndex) -> bool {
        self.lock_pending()
            .first_key_value()
            .is_some_and(|(idx, _)| *idx > pre_log_idx + 1)
    }

    /// Take up to `max_batch` pending entries that directly follow `pre_log_idx`.
    ///
    /// Entries at or below `pre_log_idx` were already shipped (by a repair
    /// or a snapshot) and are acknowledged on the spot.
    fn poll_successive(&self, pre_log_idx: LogIndex) -> Vec<Pending> {
        let mut pending = self.lock_pending();
        let rest = pending.split_off(&(pre_log_idx + 1));
        let covered = std::mem::replace(&mut *pending, rest);
        if !covered.is_empty() {
            Self::resolve(covered.into_values().collect(), AppendLogReply::accept(self.term));
        }

        let mut batch = Vec::new();
        let mut next = pre_log_idx + 1;
        while batch.len() < self.max_batch {
            match pending.first_key_value() {
                Some((idx, _)) if *idx == next => {}
                _ => break,
            }
            if let Some((_, item)) = pending.pop_first() {
                batch.push(item);
            }
            next += 1;
        }
        batch
    }

    async fn ship(
        &self,
        node: &Node,
        pre_log_idx: LogIndex,
        batch: &[Pending],
    ) -> Result<AppendLogReply> {
        let Some(pre_log_term) = node.log.term_at(pre_log_idx).await? else {
            // Compacted away on the leader: only a snapshot can bridge the gap
            return Ok(AppendLogReply::request_snapshot(self.term));
        };
        let param = AppendLogEntriesParam {
            node_id: node.id(),
            term: self.term,
            pre_log_term,
            pre_log_idx,
            commit_idx: node.committed_idx(),
            logs: batch.iter().map(|p| p.entry.clone()).collect(),
        };
        tracing::debug!(
            peer_id = self.id(),
            pre_log_idx,
            count = param.logs.len(),
            "Shipping entries"
        );
        self.follower.append_log_entries(param).await
    }

    async fn handle_success(
        &self,
        node: &Node,
        batch: Vec<Pending>,
        reply: AppendLogReply,
    ) -> LogIndex {
        let last = batch
            .last()
            .map(|p| p.entry.index)
            .unwrap_or_default();
        self.matched.fetch_max(last, Ordering::AcqRel);
        Self::resolve(batch, reply);
        node.advance_commit().await;
        last
    }

    async fn sync_snapshot(&self, node: &Node) -> Result<LogIndex> {
        let snapshot = node.snapshot_for_replication().await?;
        let apply_idx = snapshot.apply_idx;
        tracing::info!(peer_id = self.id(), apply_idx, "Replicating snapshot");
        let param = ReplicateSnapshotParam {
            node_id: node.id(),
            term: self.term,
            apply_idx,
            apply_term: snapshot.apply_term,
            data: snapshot.data,
        };
        let reply = self.follower.replicate_snapshot(param).await?;
        if !reply.success {
            if reply.term > self.term {
                node.step_down(reply.term).await;
            }
            return Err(RaftError::Transport(format!(
                "node {} rejected snapshot at term {}",
                self.id(),
                reply.term
            )));
        }
        self.matched.fetch_max(apply_idx, Ordering::AcqRel);
        Ok(apply_idx)
    }

    /// Restart shipping after `pre_log_idx`: the gap between it and the
    /// first pending entry above it is refilled from the log, at most one
    /// batch at a time. Returns how many entries were refilled.
    async fn realign(&self, node: &Node, pre_log_idx: LogIndex) -> Result<usize> {
        let first_pending = self
            .lock_pending()
            .range(pre_log_idx + 1..)
            .next()
            .map(|(idx, _)| *idx);
        let end = match first_pending {
            Some(idx) => idx,
            None => node.log.last_log().await.1 + 1,
        };
        let end = end.min(pre_log_idx + 1 + self.max_batch as LogIndex);
        let entries = node.log.get_logs(pre_log_idx + 1, end).await?;
        tracing::debug!(
            peer_id = self.id(),
            pre_log_idx,
            refilled = entries.len(),
            "Repairing follower log"
        );
        let refilled = entries.len();
        for entry in entries {
            self.enqueue(entry, None);
        }
        Ok(refilled)
    }

    fn put_back(&self, batch: Vec<Pending>) {
        let mut pending = self.lock_pending();
        for item in batch {
            match pending.entry(item.entry.index) {
                Entry::Vacant(slot) => {
                    slot.insert(item);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().waiter.is_none() {
                        *slot.get_mut() = item;
                    }
                }
            }
        }
    }

    fn resolve(batch: Vec<Pending>, reply: AppendLogReply) {
        for item in batch {
            if let Some(waiter) = item.waiter {
                let _ = waiter.send(reply);
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, BTreeMap<LogIndex, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rewind(&self) -> MutexGuard<'_, Option<LogIndex>> {
        self.rewind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
