//! Failover tests for Raft leader failure and recovery.
//!
//! These tests verify cluster behavior when leaders fail, including
//! new leader election, log persistence, and client request handling.


use std::time::Duration;

use raftplus::RaftState;
use test_harness::{commands, TestCluster};

/// Test 1: New leader is elected after leader shutdown
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let cluster = TestCluster::new(5).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster.get_node(initial_leader).unwrap().current_term().await;

    cluster.stop_node(initial_leader).await;
    assert_eq!(
        cluster.get_node(initial_leader).unwrap().node.state(),
        RaftState::Stranger
    );

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(3))
        .await
        .expect("New leader should be elected");
    assert_ne!(new_leader, initial_leader);

    let new_term = cluster.get_node(new_leader).unwrap().current_term().await;
    assert!(new_term > initial_term, "Term should increase after new election");
    assert_eq!(cluster.count_leaders(), 1, "Exactly one leader should exist");

    cluster.shutdown().await;
}

/// Test 2: Committed entries survive the loss of the leader
#[tokio::test]
async fn test_committed_entries_survive_failover() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Leader should be elected");

    for command in commands(1, 5) {
        cluster.propose_to(leader, &command).await.unwrap();
    }

    cluster.stop_node(leader).await;
    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(3))
        .await
        .expect("New leader should be elected");

    // A majority held every committed entry, so the winner has them all
    let new_leader_log = cluster.get_node(new_leader).unwrap().node.logs().await.unwrap();
    let held: Vec<String> = new_leader_log
        .iter()
        .filter(|e| e.index > 0 && !e.command.is_empty())
        .map(|e| e.command.clone())
        .collect();
    assert_eq!(held, commands(1, 5));

    // The cluster keeps accepting proposals
    let index = cluster.propose_to(new_leader, "cmd-6").await.expect("Proposal should succeed");
    assert!(index >= 6);

    let survivors: Vec<u64> = cluster.node_ids().into_iter().filter(|id| *id != leader).collect();
    assert!(
        cluster.wait_for_commands(&survivors, &commands(1, 6), Duration::from_secs(2)).await,
        "Survivors should apply the same commands"
    );

    cluster.shutdown().await;
}

/// Test 3: The old leader rejoins as a follower and catches up
#[tokio::test]
async fn test_old_leader_rejoins_as_follower() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Leader should be elected");
    cluster.propose_to(leader, "cmd-1").await.unwrap();

    cluster.stop_node(leader).await;
    let new_leader = cluster
        .wait_for_new_leader(leader, Duration::from_secs(3))
        .await
        .expect("New leader should be elected");
    cluster.propose_to(new_leader, "cmd-2").await.unwrap();
    cluster.propose_to(new_leader, "cmd-3").await.unwrap();

    cluster.start_node(leader).await;
    let settled = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("Cluster should settle");
    assert_eq!(settled, new_leader, "Restarted node must not take over");
    assert!(
        cluster.wait_for_all_commands(&commands(1, 3), Duration::from_secs(3)).await,
        "Old leader should catch up"
    );

    cluster.shutdown().await;
}

/// Test 4: A full cluster restart keeps the applied state and moves to a newer term
#[tokio::test]
async fn test_full_cluster_restart() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Leader should be elected");
    for command in commands(1, 4) {
        cluster.propose_to(leader, &command).await.unwrap();
    }
    assert!(cluster.wait_for_all_commands(&commands(1, 4), Duration::from_secs(2)).await);
    let term = cluster.get_node(leader).unwrap().current_term().await;

    cluster.shutdown().await;
    cluster.start_all().await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("Leader should be elected after restart");
    assert!(cluster.get_node(leader).unwrap().current_term().await > term);
    for node_id in cluster.node_ids() {
        assert_eq!(cluster.commands(node_id).await, commands(1, 4));
    }

    cluster.propose_to(leader, "cmd-5").await.unwrap();
    assert!(cluster.wait_for_all_commands(&commands(1, 5), Duration::from_secs(2)).await);
    cluster.shutdown().await;
}
