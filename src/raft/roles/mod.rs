//! Side effects of the transition table, one module per role.
//!
//! Each function runs on the event loop as a single [`RaftAction`](super::RaftAction).
//! Long operations (vote rounds) run inline, so the loop handles no other
//! event until the round is decided; `AcceptLeader` events published
//! meanwhile jump the queue and discard the outcome.

pub mod candidate;
pub mod follower;
pub mod leader;
pub mod pre_candidate;

use super::node::Node;
use crate::error::Result;

/// Release the worker pools of a node leaving the cluster.
pub async fn release(node: &Node) -> Result<()> {
    node.pools.set_cluster_pool(None).await;
    node.pools.set_api_pool(None).await;
    tracing::debug!(node_id = node.id(), "Released worker pools");
    Ok(())
}
