use crate::error::Result;
use crate::raft::machine::{EventParams, RaftEvent};
use crate::raft::node::Node;
use crate::raft::pool::majority_call;
use crate::raft::rpc::{Reply, RequestVoteParam};

/// Start an election: move to the next term, vote for ourselves, and
/// collect votes.
pub async fn request_votes(node: &Node, params: EventParams) -> Result<()> {
    let Some(term) = node.increase_term(params.term).await? else {
        tracing::debug!(
            node_id = node.id(),
            term = params.term,
            "Term moved on, abandoning election"
        );
        node.publish(RaftEvent::VoteFailed, EventParams::at(node.term().await))
            .await;
        return Ok(());
    };

    let pool = node.pools.cluster_pool().await?;
    let peers = node.peers().await;
    let (last_log_term, last_log_idx) = node.log.last_log().await;
    let param = RequestVoteParam {
        node_id: node.id(),
        term,
        last_log_term,
        last_log_idx,
    };
    tracing::info!(node_id = node.id(), term, "Starting election");

    let outcome = majority_call(
        &pool,
        "request_vote",
        &peers,
        node.config().rpc_timeout(),
        |peer| {
            let param = param.clone();
            async move { peer.request_vote(param).await }
        },
        |reply: &Reply| reply.success,
    )
    .await;

    if let Some(higher) = outcome
        .replies
        .iter()
        .map(|r| r.term)
        .filter(|t| *t > term)
        .max()
    {
        node.step_down(higher).await;
    }

    if outcome.success {
        let votes = outcome.replies.iter().filter(|r| r.success).count() + 1;
        tracing::info!(node_id = node.id(), term, votes, "Won election");
        node.publish(RaftEvent::ToLeader, EventParams::at(term)).await;
    } else {
        tracing::info!(node_id = node.id(), term, "Election lost");
        node.publish(RaftEvent::VoteFailed, EventParams::at(node.term().await))
            .await;
    }
    Ok(())
}
