use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::Result;
use crate::raft::machine::{EventParams, RaftEvent};
use crate::raft::node::Node;
use crate::raft::pool::WorkerPool;
use crate::raft::timer::random_election_timeout;

/// Allocate the pools an active node needs.
pub async fn init(node: &Node) -> Result<()> {
    let config = node.config();
    node.pools
        .set_cluster_pool(Some(WorkerPool::new(
            format!("cluster-{}", node.id()),
            config.cluster_pool_size,
        )))
        .await;
    node.pools
        .set_api_pool(Some(WorkerPool::new(
            format!("api-{}", node.id()),
            config.api_pool_size,
        )))
        .await;
    Ok(())
}

/// Watch for a missing leader.
///
/// Every tick compares the time since the last heartbeat (or since entering
/// the role, if later) against a timeout drawn once per role entry, and
/// publishes a single `PingTimeout` when it is exceeded.
pub async fn start_timeout_scheduler(node: &Node) -> Result<()> {
    let timeout = random_election_timeout(node.config(), node.priority());
    let entered_at = Instant::now();
    let fired = Arc::new(AtomicBool::new(false));
    let handle = node.handle();
    tracing::debug!(
        node_id = node.id(),
        timeout_ms = timeout.as_millis() as u64,
        "Waiting for leader heartbeats"
    );

    node.schedulers
        .set_timeout_scheduler(node.config().tick_interval(), move || {
            let handle = handle.clone();
            let fired = fired.clone();
            async move {
                if fired.load(Ordering::Acquire) {
                    return;
                }
                let Some(node) = handle.upgrade() else {
                    return;
                };
                if let Some(term) = node.heartbeat_expired(entered_at, timeout).await {
                    fired.store(true, Ordering::Release);
                    tracing::info!(node_id = node.id(), term, "Leader heartbeat timed out");
                    node.publish(RaftEvent::PingTimeout, EventParams::at(term)).await;
                }
            }
        })
        .await;
    Ok(())
}
