use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, RwLock};
use tokio::time::Duration;

use super::pool::{majority_call, WorkerPool};
use super::proxy::NodeProxy;
use super::state::LogEntry;
use super::{LogIndex, NodeId};
use crate::error::{RaftError, Result};

type Turnstile = Mutex<BTreeMap<LogIndex, Arc<Notify>>>;

fn lock(turns: &Turnstile) -> MutexGuard<'_, BTreeMap<LogIndex, Arc<Notify>>> {
    turns.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A proposal's place in the apply order.
///
/// Dropping it leaves the queue and hands the turn to the next lowest
/// index, on every exit path including a cancelled proposal.
pub struct Turn {
    turns: Arc<Turnstile>,
    index: LogIndex,
    notify: Arc<Notify>,
}

impl Turn {
    pub fn index(&self) -> LogIndex {
        self.index
    }

    async fn wait(&self) {
        loop {
            let first = lock(&self.turns).first_key_value().map(|(idx, _)| *idx);
            if first == Some(self.index) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut turns = lock(&self.turns);
        turns.remove(&self.index);
        if let Some((_, next)) = turns.first_key_value() {
            next.notify_one();
        }
    }
}

/// Fans proposals out to every [`NodeProxy`] and applies them locally in
/// strictly increasing index order, whatever order the majorities arrive in.
#[derive(Default)]
pub struct ProposeHelper {
    proxies: RwLock<Vec<Arc<NodeProxy>>>,
    turns: Arc<Turnstile>,
}

impl ProposeHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install and start one pipeline per follower. Pipelines of a previous
    /// leadership are stopped first.
    pub async fn start(&self, proxies: Vec<Arc<NodeProxy>>, pre_log_idx: LogIndex) {
        self.clear().await;
        for proxy in &proxies {
            proxy.start(pre_log_idx);
        }
        *self.proxies.write().await = proxies;
    }

    /// Stop every pipeline. Proposals waiting on them fail.
    pub async fn clear(&self) {
        let proxies = std::mem::take(&mut *self.proxies.write().await);
        if proxies.is_empty() {
            return;
        }
        tracing::debug!(count = proxies.len(), "Stopping replication pipelines");
        let mut stops = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            stops.push(tokio::spawn(async move { proxy.stop().await }));
        }
        for stop in stops {
            if let Err(e) = stop.await {
                tracing::warn!(error = %e, "Pipeline stop task failed");
            }
        }
    }

    pub async fn proxies(&self) -> Vec<Arc<NodeProxy>> {
        self.proxies.read().await.clone()
    }

    /// `(follower, matched index)` for every running pipeline.
    pub async fn match_indexes(&self) -> Vec<(NodeId, LogIndex)> {
        self.proxies
            .read()
            .await
            .iter()
            .map(|p| (p.id(), p.matched()))
            .collect()
    }

    /// Hand a heartbeat's resume hint to the follower's pipeline.
    pub async fn rewind(&self, follower: NodeId, compare_idx: LogIndex) {
        let proxies = self.proxies.read().await;
        if let Some(proxy) = proxies.iter().find(|p| p.id() == follower) {
            proxy.rewind(compare_idx);
        }
    }

    /// Take a place in the apply order. Must be called in index order, so
    /// the caller registers right when it allocates the index.
    pub fn register(&self, index: LogIndex) -> Turn {
        let notify = Arc::new(Notify::new());
        lock(&self.turns).insert(index, notify.clone());
        Turn {
            turns: self.turns.clone(),
            index,
            notify,
        }
    }

    /// Replicate `entry` to a majority, then run `apply` once every lower
    /// pending proposal has finished.
    ///
    /// `followers` is the expected pipeline count. A mismatch means the
    /// leadership ended after `entry` was written; the outcome is then
    /// unknown and reported as [`RaftError::ProposeFailed`].
    pub async fn propose<F, Fut>(
        &self,
        turn: Turn,
        pool: &WorkerPool,
        timeout: Duration,
        followers: usize,
        entry: LogEntry,
        apply: F,
    ) -> Result<LogIndex>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let index = entry.index;
        let proxies = self.proxies().await;
        if proxies.len() != followers {
            tracing::warn!(index, term = entry.term, "Pipelines gone before replication");
            return Err(RaftError::ProposeFailed(index));
        }

        let outcome = majority_call(
            pool,
            "propose",
            &proxies,
            timeout,
            |proxy: Arc<NodeProxy>| {
                let entry = entry.clone();
                async move { proxy.append_log(entry).await }
            },
            |reply| reply.success,
        )
        .await;

        if !outcome.success {
            tracing::warn!(index, term = entry.term, "Proposal not accepted by a majority");
            return Err(RaftError::ProposeFailed(index));
        }

        turn.wait().await;
        apply().await?;
        drop(turn);
        Ok(index)
    }

    pub fn pending(&self) -> usize {
        lock(&self.turns).len()
    }
}
