use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::{self, Duration, Instant};
use tokio_util::task::TaskTracker;

use crate::error::{RaftError, Result};

/// Bounded pool of tokio tasks.
///
/// At most `size` spawned futures run at once; the rest wait for a permit.
/// `shutdown` stops accepting work and waits for what is already running.
pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(RaftError::Shutdown);
        }
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            fut.await;
        });
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(pool = %self.name, "Worker pool drained");
    }
}

/// The two pools a node owns while it is part of the cluster.
///
/// - cluster: votes, pre-votes, heartbeats
/// - api: fan-out of client proposals to the replication pipelines
#[derive(Default)]
pub struct WorkerPools {
    cluster: RwLock<Option<Arc<WorkerPool>>>,
    api: RwLock<Option<Arc<WorkerPool>>>,
}

impl WorkerPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cluster_pool(&self) -> Result<Arc<WorkerPool>> {
        self.cluster.read().await.clone().ok_or(RaftError::NotReady)
    }

    pub async fn api_pool(&self) -> Result<Arc<WorkerPool>> {
        self.api.read().await.clone().ok_or(RaftError::NotReady)
    }

    pub async fn set_cluster_pool(&self, pool: Option<WorkerPool>) {
        Self::swap(&self.cluster, pool).await;
    }

    pub async fn set_api_pool(&self, pool: Option<WorkerPool>) {
        Self::swap(&self.api, pool).await;
    }

    /// Install `pool` and shut the previous one down after the lock is released.
    async fn swap(slot: &RwLock<Option<Arc<WorkerPool>>>, pool: Option<WorkerPool>) {
        let previous = {
            let mut slot = slot.write().await;
            std::mem::replace(&mut *slot, pool.map(Arc::new))
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }
}

/// Outcome of a [`majority_call`] round.
#[derive(Debug)]
pub struct Majority<R> {
    pub success: bool,
    /// Replies received before the round ended.
    pub replies: Vec<R>,
}

/// Call every target on `pool` and wait until a majority succeeds.
///
/// With `n` targets (the local node excluded) the round succeeds once
/// `(n + 1) / 2` of them reply with success, which together with the local
/// node is a strict majority of the cluster. No targets means a single-node
/// cluster and succeeds immediately. The round gives up after `timeout` or
/// once every target has answered; calls still running then are dropped.
/// Failed calls are logged and counted as non-success.
pub async fn majority_call<T, F, Fut, R, S>(
    pool: &WorkerPool,
    method: &'static str,
    targets: &[T],
    timeout: Duration,
    call: F,
    is_success: S,
) -> Majority<R>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
    S: Fn(&R) -> bool,
{
    if targets.is_empty() {
        return Majority {
            success: true,
            replies: Vec::new(),
        };
    }

    let needed = (targets.len() + 1) / 2;
    let deadline = Instant::now() + timeout;
    let (tx, mut rx) = mpsc::channel(targets.len());
    for target in targets {
        let tx = tx.clone();
        let fut = call(target.clone());
        // Calls never outlive the round, so a slow peer cannot hold a permit
        let spawned = pool.spawn(async move {
            if let Ok(reply) = time::timeout_at(deadline, fut).await {
                let _ = tx.send(reply).await;
            }
        });
        if let Err(e) = spawned {
            tracing::warn!(method, pool = pool.name(), error = %e, "Could not schedule peer call");
        }
    }
    drop(tx);

    let mut successes = 0;
    let mut replies = Vec::with_capacity(targets.len());
    loop {
        match time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Ok(reply))) => {
                if is_success(&reply) {
                    successes += 1;
                }
                replies.push(reply);
                if successes >= needed {
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(method, error = %e, "Peer call failed");
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(method, successes, needed, "Majority call timed out");
                break;
            }
        }
    }

    Majority {
        success: successes >= needed,
        replies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(matches!(pool.spawn(async {}), Err(RaftError::Shutdown)));
    }

    #[tokio::test]
    async fn test_pools_swap_and_clear() {
        let pools = WorkerPools::new();
        assert!(matches!(pools.cluster_pool().await, Err(RaftError::NotReady)));

        pools.set_cluster_pool(Some(WorkerPool::new("cluster", 4))).await;
        let old = pools.cluster_pool().await.unwrap();

        pools.set_cluster_pool(Some(WorkerPool::new("cluster", 4))).await;
        assert!(old.is_closed());
        assert!(!pools.cluster_pool().await.unwrap().is_closed());

        pools.set_cluster_pool(None).await;
        assert!(pools.cluster_pool().await.is_err());
    }

    #[tokio::test]
    async fn test_majority_with_no_targets_succeeds() {
        let pool = WorkerPool::new("test", 1);
        let targets: Vec<u64> = Vec::new();
        let outcome = majority_call(
            &pool,
            "noop",
            &targets,
            Duration::from_millis(10),
            |_| async { Ok(true) },
            |ok: &bool| *ok,
        )
        .await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_majority_counts_errors_as_failure() {
        let pool = WorkerPool::new("test", 4);
        // 4 peers: 2 successes are needed
        let targets = vec![1u64, 2, 3, 4];

        let outcome = majority_call(
            &pool,
            "vote",
            &targets,
            Duration::from_millis(200),
            |id| async move {
                if id <= 2 {
                    Ok(true)
                } else {
                    Err(RaftError::Transport("unreachable".into()))
                }
            },
            |ok: &bool| *ok,
        )
        .await;
        assert!(outcome.success);

        let outcome = majority_call(
            &pool,
            "vote",
            &targets,
            Duration::from_millis(200),
            |id| async move {
                if id == 1 {
                    Ok(true)
                } else if id == 2 {
                    Ok(false)
                } else {
                    Err(RaftError::NotReady)
                }
            },
            |ok: &bool| *ok,
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.replies.len(), 2);
    }

    #[tokio::test]
    async fn test_majority_times_out() {
        let pool = WorkerPool::new("test", 4);
        let targets = vec![1u64, 2];
        let started = Instant::now();

        let outcome = majority_call(
            &pool,
            "heartbeat",
            &targets,
            Duration::from_millis(50),
            |_| async {
                time::sleep(Duration::from_secs(5)).await;
                Ok(true)
            },
            |ok: &bool| *ok,
        )
        .await;
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
