use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::raft::machine::{EventParams, RaftEvent};
use crate::raft::node::Node;
use crate::raft::pool::majority_call;
use crate::raft::proxy::NodeProxy;
use crate::raft::rpc::{AppendLogEntriesParam, AppendLogReply};
use crate::raft::state::NO_OP;
use crate::raft::Term;

/// Take office: one replication pipeline per follower, periodic
/// heartbeats, and a no-op barrier when the log holds entries that are not
/// known to be committed.
pub async fn init(node: &Node) -> Result<()> {
    let term = node.term().await;
    node.set_leader(node.id()).await;

    let (_, last) = node.log.last_log().await;
    let config = node.config();
    let proxies: Vec<Arc<NodeProxy>> = node
        .peers()
        .await
        .into_iter()
        .map(|peer| {
            Arc::new(NodeProxy::new(
                node.handle(),
                peer,
                term,
                config.max_batch,
                config.proxy_idle(),
            ))
        })
        .collect();
    node.propose_helper.start(proxies, last).await;

    if !node.begin_leading(term).await {
        tracing::debug!(node_id = node.id(), term, "Term moved on while taking office");
        return Ok(());
    }

    let handle = node.handle();
    node.schedulers
        .set_heartbeat_scheduler(config.heartbeat_interval(), move || {
            let handle = handle.clone();
            async move {
                let Some(node) = handle.upgrade() else {
                    return;
                };
                if let Err(e) = heartbeat(&node, term).await {
                    tracing::warn!(node_id = node.id(), term, error = %e, "Heartbeat round failed");
                }
            }
        })
        .await;

    if last > node.committed_idx() {
        if let Some(me) = node.handle().upgrade() {
            tokio::spawn(async move {
                match me.propose(NO_OP).await {
                    Ok(index) => tracing::debug!(
                        node_id = me.id(),
                        index,
                        "No-op barrier committed"
                    ),
                    Err(e) => tracing::warn!(node_id = me.id(), error = %e, "No-op barrier failed"),
                }
            });
        }
    }

    tracing::info!(node_id = node.id(), term, last_log_idx = last, "Became leader");
    Ok(())
}

/// Leave office: no more heartbeats, and every pipeline is stopped, which
/// fails the proposals still waiting on them.
pub async fn stop(node: &Node) -> Result<()> {
    node.end_leading().await;
    node.schedulers.clear_heartbeat_scheduler().await;
    node.propose_helper.clear().await;
    Ok(())
}

/// One heartbeat round. Losing the majority demotes the leader; otherwise
/// entries committed by the pipelines are applied locally.
async fn heartbeat(node: &Node, term: Term) -> Result<()> {
    let pool = node.pools.cluster_pool().await?;
    let peers = node.peers().await;
    let committed = node.committed_idx();
    // Anchored at the committed entry so followers holding it can commit too
    let anchor = node.log.term_at(committed).await?.unwrap_or_default();
    let param = AppendLogEntriesParam {
        pre_log_term: anchor,
        pre_log_idx: committed,
        ..AppendLogEntriesParam::heartbeat(node.id(), term, committed)
    };

    let outcome = majority_call(
        &pool,
        "heartbeat",
        &peers,
        node.config().rpc_timeout(),
        |peer| {
            let param = param.clone();
            let handle = node.handle();
            async move {
                let reply = peer.append_log_entries(param).await?;
                // Lagging followers still count, but their pipeline has to catch them up
                if let (true, Some(compare_idx)) = (reply.success, reply.compare_idx) {
                    if let Some(node) = handle.upgrade() {
                        node.propose_helper.rewind(peer.id(), compare_idx).await;
                    }
                }
                Ok::<_, RaftError>(reply)
            }
        },
        |reply: &AppendLogReply| reply.success,
    )
    .await;

    if let Some(higher) = outcome
        .replies
        .iter()
        .map(|r| r.term)
        .filter(|t| *t > term)
        .max()
    {
        tracing::info!(
            node_id = node.id(),
            term,
            peer_term = higher,
            "Newer term seen in heartbeat reply"
        );
        node.step_down(higher).await;
        return Ok(());
    }

    if !outcome.success {
        tracing::warn!(node_id = node.id(), term, "Lost contact with a majority");
        node.publish(RaftEvent::NetworkPartition, EventParams::at(term)).await;
        return Ok(());
    }

    node.apply_up_to(node.committed_idx()).await
}
