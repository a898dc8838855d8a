use crate::error::Result;
use crate::raft::machine::{EventParams, RaftEvent};
use crate::raft::node::Node;
use crate::raft::pool::majority_call;
use crate::raft::rpc::{PreVoteParam, Reply};

/// Ask the cluster whether an election at the next term could succeed.
///
/// Pre-votes carry the current term and change nothing on the voters, so a
/// node that cannot win never disturbs the cluster by bumping its term.
pub async fn pre_vote(node: &Node, params: EventParams) -> Result<()> {
    let pool = node.pools.cluster_pool().await?;
    let peers = node.peers().await;
    let (last_log_term, last_log_idx) = node.log.last_log().await;
    let param = PreVoteParam {
        node_id: node.id(),
        term: params.term,
        last_log_term,
        last_log_idx,
    };
    tracing::debug!(node_id = node.id(), term = params.term, "Starting pre-vote");

    let outcome = majority_call(
        &pool,
        "pre_vote",
        &peers,
        node.config().rpc_timeout(),
        |peer| {
            let param = param.clone();
            async move { peer.pre_vote(param).await }
        },
        |reply: &Reply| reply.success,
    )
    .await;

    if let Some(higher) = outcome
        .replies
        .iter()
        .map(|r| r.term)
        .filter(|t| *t > params.term)
        .max()
    {
        node.step_down(higher).await;
    }

    if outcome.success {
        tracing::info!(node_id = node.id(), term = params.term, "Pre-vote succeeded");
        node.publish(RaftEvent::PrevoteSuccess, params).await;
    } else {
        tracing::debug!(node_id = node.id(), term = params.term, "Pre-vote failed");
        node.publish(RaftEvent::PrevoteFailed, EventParams::at(node.term().await))
            .await;
    }
    Ok(())
}
