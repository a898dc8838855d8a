use std::future::Future;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RaftConfig;

/// Generates a follower election timeout.
///
/// `base + priority * step + rand(0..=random_factor)`: nodes with a lower
/// priority value tend to time out first.
pub fn random_election_timeout(config: &RaftConfig, priority: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(0..=config.timeout_random_factor_ms);
    let timeout_ms = config.base_timeout_ms + priority * config.priority_step_ms + jitter;
    Duration::from_millis(timeout_ms)
}

struct Scheduled {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic tasks owned by a role: the follower timeout check and the
/// leader heartbeat.
///
/// Setting a scheduler replaces the previous one. Clearing cancels it and
/// waits for the task to finish, so no tick of an old role can run once the
/// call returns.
#[derive(Default)]
pub struct Schedulers {
    timeout: Mutex<Option<Scheduled>>,
    heartbeat: Mutex<Option<Scheduled>>,
}

impl Schedulers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First tick after one `period`.
    pub async fn set_timeout_scheduler<F, Fut>(&self, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::set(&self.timeout, Instant::now() + period, period, tick).await;
    }

    pub async fn clear_timeout_scheduler(&self) {
        Self::clear(&self.timeout).await;
    }

    /// First tick immediately.
    pub async fn set_heartbeat_scheduler<F, Fut>(&self, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::set(&self.heartbeat, Instant::now(), period, tick).await;
    }

    pub async fn clear_heartbeat_scheduler(&self) {
        Self::clear(&self.heartbeat).await;
    }

    pub async fn clear_all(&self) {
        self.clear_timeout_scheduler().await;
        self.clear_heartbeat_scheduler().await;
    }

    async fn set<F, Fut>(
        slot: &Mutex<Option<Scheduled>>,
        start: Instant,
        period: Duration,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tick() => {}
                }
            }
        });

        let previous = slot.lock().await.replace(Scheduled { token, handle });
        if let Some(previous) = previous {
            Self::shutdown(previous).await;
        }
    }

    async fn clear(slot: &Mutex<Option<Scheduled>>) {
        let previous = slot.lock().await.take();
        if let Some(previous) = previous {
            Self::shutdown(previous).await;
        }
    }

    async fn shutdown(scheduled: Scheduled) {
        scheduled.token.cancel();
        if let Err(e) = scheduled.handle.await {
            tracing::warn!(error = %e, "Scheduled task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_election_timeout_range() {
        let config = RaftConfig::default().with_timeouts(100, 20, 10);
        for _ in 0..100 {
            let t = random_election_timeout(&config, 0);
            assert!(t >= Duration::from_millis(100) && t <= Duration::from_millis(120));

            let t = random_election_timeout(&config, 3);
            assert!(t >= Duration::from_millis(130) && t <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_heartbeat_scheduler_ticks_until_cleared() {
        let schedulers = Schedulers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        schedulers
            .set_heartbeat_scheduler(Duration::from_millis(10), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        time::sleep(Duration::from_millis(55)).await;
        schedulers.clear_heartbeat_scheduler().await;
        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected several ticks, got {}", ticks);

        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_timeout_scheduler_waits_one_period() {
        let schedulers = Schedulers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        schedulers
            .set_timeout_scheduler(Duration::from_millis(200), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        schedulers.clear_all().await;
    }

    #[tokio::test]
    async fn test_set_replaces_previous_scheduler() {
        let schedulers = Schedulers::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        schedulers
            .set_heartbeat_scheduler(Duration::from_millis(5), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        time::sleep(Duration::from_millis(20)).await;

        let c = second.clone();
        schedulers
            .set_heartbeat_scheduler(Duration::from_millis(5), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        let frozen = first.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first.load(Ordering::SeqCst), frozen);
        assert!(second.load(Ordering::SeqCst) > 0);
        schedulers.clear_all().await;
    }
}
