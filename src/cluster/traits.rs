//! Leadership backend contract.
//!
//! The node coordinator never decides leadership on its own: it asks a
//! strongly-consistent backend (a consensus-backed store in production, the
//! in-memory [`InMemoryLeadership`](super::InMemoryLeadership) in tests) to
//! register nodes and to grant partition leadership atomically.
//!
//! # Guarantees required of implementations
//!
//! - Concurrent [`acquire_topic_leader`](LeadershipBackend::acquire_topic_leader)
//!   calls for one (topic, partition) are serialized: exactly one succeeds while
//!   a leader is live, the rest get [`CoordError::LeaderAlreadyExists`].
//! - Every successful acquisition bumps both `topic_info.epoch` and
//!   `leader_epoch`; neither ever decreases.
//! - `unregister` of an absent node and `release_topic_leader` of an absent
//!   partition are no-ops.
//!
//! [`CoordError::LeaderAlreadyExists`]: super::CoordError::LeaderAlreadyExists

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::error::CoordResult;
use crate::types::{NodeIdentity, TopicLeaderSession, TopicPartitionMetaInfo};

/// Strongly-consistent store brokering node registration and partition leadership.
#[async_trait]
pub trait LeadershipBackend: Send + Sync {
    // ========================================================================
    // Cluster & Node Registration
    // ========================================================================

    /// Set the cluster identifier that namespaces all later operations.
    ///
    /// Idempotent. Must be called before any other operation.
    async fn init_cluster_id(&self, id: &str);

    /// Insert or overwrite the registration for `node.id()`.
    async fn register(&self, node: &NodeIdentity) -> CoordResult<()>;

    /// Remove the registration for `node.id()`. Absent nodes are not an error.
    async fn unregister(&self, node: &NodeIdentity) -> CoordResult<()>;

    /// All currently registered nodes.
    async fn registered_nodes(&self) -> CoordResult<Vec<NodeIdentity>>;

    // ========================================================================
    // Partition Leadership
    // ========================================================================

    /// Atomically try to make `node` the leader of `topic/partition`.
    ///
    /// Returns the new leader session on success. Fails with
    /// `LeaderAlreadyExists` if a leader is live; the incumbent is never replaced.
    async fn acquire_topic_leader(
        &self,
        topic: &str,
        partition: i32,
        node: &NodeIdentity,
    ) -> CoordResult<TopicLeaderSession>;

    /// Clear leadership of `topic/partition`. No-op if the partition is unknown.
    async fn release_topic_leader(&self, topic: &str, partition: i32) -> CoordResult<()>;

    /// Current replication view, or `TopicNotExist` if never acquired.
    async fn get_topic_info(&self, topic: &str, partition: i32)
    -> CoordResult<TopicPartitionMetaInfo>;

    // ========================================================================
    // Cluster Leader Watch
    // ========================================================================

    /// Subscribe to cluster-leader changes for `key`.
    ///
    /// Returns once the subscription is established; events are delivered on
    /// `notify` from a background task until `stop` fires (or its sender is
    /// dropped) or `notify` is closed.
    async fn watch_cluster_leader(
        &self,
        key: &str,
        notify: mpsc::Sender<NodeIdentity>,
        stop: oneshot::Receiver<()>,
    ) -> CoordResult<()>;
}
