//! Leadership backend contract tests against `InMemoryLeadership`.
//!
//! These tests verify:
//! 1. Registration is idempotent
//! 2. Exactly one of several concurrent acquirers wins
//! 3. Epochs strictly increase across acquire/release cycles
//! 4. Session tokens are derived from leader id and epoch
//! 5. Queries on never-acquired partitions report "not exist"

use std::sync::Arc;

use partcoord::cluster::{CoordError, InMemoryLeadership, LeadershipBackend};
use partcoord::types::{Epoch, NodeIdentity, TopicLeaderSession, session_token};

async fn backend() -> InMemoryLeadership {
    let backend = InMemoryLeadership::new();
    backend.init_cluster_id("leadership-tests").await;
    backend
}

fn node(port: u16) -> NodeIdentity {
    NodeIdentity::new("127.0.0.1", port, "")
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_unregister_twice_is_idempotent() {
    let backend = backend().await;
    let n1 = node(7001);

    backend.register(&n1).await.unwrap();
    assert!(backend.is_registered(n1.id()).await);

    backend.unregister(&n1).await.unwrap();
    backend.unregister(&n1).await.unwrap();

    assert!(!backend.is_registered(n1.id()).await);
    assert!(backend.registered_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregister_never_registered_node_is_ok() {
    let backend = backend().await;
    backend.unregister(&node(7002)).await.unwrap();
}

// ============================================================================
// Acquisition
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquisition_has_single_winner() {
    let backend = Arc::new(backend().await);

    let mut handles = Vec::new();
    for port in 8000..8008 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let n = node(port);
            let result = backend.acquire_topic_leader("orders", 0, &n).await;
            (n, result)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (n, result) = handle.await.unwrap();
        match result {
            Ok(session) => winners.push((n, session)),
            Err(e) => assert!(e.is_contention(), "unexpected error: {}", e),
        }
    }

    assert_eq!(winners.len(), 1);
    let (winner, session) = &winners[0];
    let info = backend.get_topic_info("orders", 0).await.unwrap();
    assert_eq!(info.leader, winner.id());
    assert_eq!(session.leader_id(), Some(winner.id()));
    assert_eq!(info.isr, vec![winner.id().to_string()]);
}

#[tokio::test]
async fn test_acquire_with_live_leader_keeps_incumbent() {
    let backend = backend().await;
    let n1 = node(1);
    let n2 = node(2);

    let first = backend.acquire_topic_leader("orders", 0, &n1).await.unwrap();
    let err = backend
        .acquire_topic_leader("orders", 0, &n2)
        .await
        .unwrap_err();

    assert!(matches!(err, CoordError::LeaderAlreadyExists { .. }));
    assert!(err.to_string().contains("already exist"));

    let info = backend.get_topic_info("orders", 0).await.unwrap();
    assert_eq!(info.leader, n1.id());
    assert_eq!(info.epoch, first.leader_epoch);
}

#[tokio::test]
async fn test_partitions_are_independent() {
    let backend = backend().await;
    let n1 = node(1);
    let n2 = node(2);

    backend.acquire_topic_leader("orders", 0, &n1).await.unwrap();
    backend.acquire_topic_leader("orders", 1, &n2).await.unwrap();
    backend.acquire_topic_leader("events", 0, &n2).await.unwrap();

    assert_eq!(backend.leader_count().await, 3);
}

// ============================================================================
// Epochs & sessions
// ============================================================================

#[tokio::test]
async fn test_epochs_strictly_increase_across_cycles() {
    let backend = backend().await;
    let nodes = [node(1), node(2), node(3), node(1)];

    let mut last_leader_epoch = Epoch::ZERO;
    let mut last_info_epoch = Epoch::ZERO;
    for n in &nodes {
        let session = backend.acquire_topic_leader("orders", 0, n).await.unwrap();
        let info = backend.get_topic_info("orders", 0).await.unwrap();

        assert!(session.leader_epoch > last_leader_epoch);
        assert!(info.epoch > last_info_epoch);
        last_leader_epoch = session.leader_epoch;
        last_info_epoch = info.epoch;

        backend.release_topic_leader("orders", 0).await.unwrap();
    }

    assert_eq!(last_leader_epoch, Epoch(4));
}

#[tokio::test]
async fn test_session_is_leader_id_followed_by_epoch() {
    let backend = backend().await;

    for (round, n) in [node(10), node(11), node(12)].iter().enumerate() {
        let session = backend.acquire_topic_leader("orders", 0, n).await.unwrap();
        assert_eq!(session.session, format!("{}{}", n.id(), round + 1));
        assert_eq!(session.session, session_token(n.id(), session.leader_epoch));
        backend.release_topic_leader("orders", 0).await.unwrap();
    }
}

#[tokio::test]
async fn test_sessions_equal_only_when_both_components_match() {
    let a1 = TopicLeaderSession::new(node(1), Epoch(1));
    let a1_again = TopicLeaderSession::new(node(1), Epoch(1));
    let a2 = TopicLeaderSession::new(node(1), Epoch(2));
    let b1 = TopicLeaderSession::new(node(2), Epoch(1));

    assert!(a1.is_same(&a1_again));
    assert!(!a1.is_same(&a2));
    assert!(!a1.is_same(&b1));
}

#[tokio::test]
async fn test_leader_is_always_in_isr() {
    let backend = backend().await;

    for n in [node(1), node(2), node(1), node(3)] {
        backend.acquire_topic_leader("orders", 0, &n).await.unwrap();
        let info = backend.get_topic_info("orders", 0).await.unwrap();
        assert!(info.is_in_isr(&info.leader));
        backend.release_topic_leader("orders", 0).await.unwrap();
    }

    let info = backend.get_topic_info("orders", 0).await.unwrap();
    assert_eq!(info.isr.len(), 3);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_get_topic_info_on_unknown_partition_is_not_exist() {
    let backend = backend().await;
    backend.acquire_topic_leader("orders", 0, &node(1)).await.unwrap();

    let err = backend.get_topic_info("orders", 1).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("not exist"));

    let err = backend.get_topic_info("never", 0).await.unwrap_err();
    assert!(err.is_not_found());
}
