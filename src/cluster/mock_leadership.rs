//! In-memory leadership backend for testing.
//!
//! Implements [`LeadershipBackend`] with instance-owned maps guarded by
//! `tokio::sync::RwLock`. Clones share state, so several node coordinators in
//! one test can contend for the same partitions through a single backend.
//!
//! # Usage
//!
//! Available during unit tests or with the `test-utilities` feature:
//!
//! ```toml
//! [dev-dependencies]
//! partcoord = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::error::{CoordError, CoordResult};
use super::topic_coordinator::TopicCoordinator;
use super::traits::LeadershipBackend;
use crate::types::{NodeIdentity, TopicLeaderSession, TopicPartitionMetaInfo};

/// Type alias for the topic map: topic -> partition -> coordinator.
pub type TopicsMap = HashMap<String, HashMap<i32, TopicCoordinator>>;

/// Capacity of the cluster-leader event fan-out.
const LEADER_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct InMemoryLeadership {
    /// Cluster namespace, `None` until `init_cluster_id`.
    cluster_id: Arc<RwLock<Option<String>>>,
    /// Registered nodes keyed by id.
    nodes: Arc<RwLock<HashMap<String, NodeIdentity>>>,
    /// Partition coordinators.
    topics: Arc<RwLock<TopicsMap>>,
    /// Last published cluster leader per watch key.
    cluster_leaders: Arc<RwLock<HashMap<String, NodeIdentity>>>,
    /// Fan-out of (key, leader) change events to watch tasks.
    leader_events: broadcast::Sender<(String, NodeIdentity)>,
    /// Number of live watch subscriptions.
    active_watches: Arc<AtomicUsize>,
}

impl Default for InMemoryLeadership {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeadership {
    pub fn new() -> Self {
        let (leader_events, _) = broadcast::channel(LEADER_EVENT_CAPACITY);
        Self {
            cluster_id: Arc::new(RwLock::new(None)),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
            cluster_leaders: Arc::new(RwLock::new(HashMap::new())),
            leader_events,
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The cluster id set by `init_cluster_id`, if any.
    pub async fn cluster_id(&self) -> Option<String> {
        self.cluster_id.read().await.clone()
    }

    /// Whether a node id is currently registered.
    pub async fn is_registered(&self, node_id: &str) -> bool {
        self.nodes.read().await.contains_key(node_id)
    }

    /// Number of partitions that currently have a live leader.
    pub async fn leader_count(&self) -> usize {
        self.topics
            .read()
            .await
            .values()
            .flat_map(|partitions| partitions.values())
            .filter(|tc| tc.has_leader())
            .count()
    }

    /// Number of watch subscriptions that have not been torn down.
    pub fn active_watch_count(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    /// Announce a new cluster leader for `key` to every live watcher.
    pub async fn publish_cluster_leader(&self, key: &str, leader: NodeIdentity) {
        self.cluster_leaders
            .write()
            .await
            .insert(key.to_string(), leader.clone());
        // No receivers is fine: nobody is watching yet.
        let _ = self.leader_events.send((key.to_string(), leader));
    }

    async fn ensure_cluster_id(&self) -> CoordResult<()> {
        if self.cluster_id.read().await.is_none() {
            return Err(CoordError::ClusterIdNotSet);
        }
        Ok(())
    }
}

#[async_trait]
impl LeadershipBackend for InMemoryLeadership {
    async fn init_cluster_id(&self, id: &str) {
        *self.cluster_id.write().await = Some(id.to_string());
    }

    async fn register(&self, node: &NodeIdentity) -> CoordResult<()> {
        self.ensure_cluster_id().await?;
        if !node.is_well_formed() {
            return Err(CoordError::InvalidNode(node.id().to_string()));
        }
        self.nodes
            .write()
            .await
            .insert(node.id().to_string(), node.clone());
        debug!(node = %node, "Registered node");
        Ok(())
    }

    async fn unregister(&self, node: &NodeIdentity) -> CoordResult<()> {
        self.ensure_cluster_id().await?;
        if self.nodes.write().await.remove(node.id()).is_some() {
            debug!(node = %node, "Unregistered node");
        }
        Ok(())
    }

    async fn registered_nodes(&self) -> CoordResult<Vec<NodeIdentity>> {
        self.ensure_cluster_id().await?;
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn acquire_topic_leader(
        &self,
        topic: &str,
        partition: i32,
        node: &NodeIdentity,
    ) -> CoordResult<TopicLeaderSession> {
        self.ensure_cluster_id().await?;

        // One write lock covers lookup, creation and promotion, which
        // serializes concurrent acquisitions of the same partition.
        let mut topics = self.topics.write().await;
        let coordinator = topics
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_insert_with(|| TopicCoordinator::new(topic, partition));

        coordinator.promote(node)
    }

    async fn release_topic_leader(&self, topic: &str, partition: i32) -> CoordResult<()> {
        self.ensure_cluster_id().await?;
        let mut topics = self.topics.write().await;
        if let Some(coordinator) = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(&partition))
        {
            coordinator.clear_leader();
        }
        Ok(())
    }

    async fn get_topic_info(
        &self,
        topic: &str,
        partition: i32,
    ) -> CoordResult<TopicPartitionMetaInfo> {
        self.ensure_cluster_id().await?;
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .map(|tc| tc.topic_info().clone())
            .ok_or_else(|| CoordError::TopicNotExist {
                topic: topic.to_string(),
                partition,
            })
    }

    async fn watch_cluster_leader(
        &self,
        key: &str,
        notify: mpsc::Sender<NodeIdentity>,
        stop: oneshot::Receiver<()>,
    ) -> CoordResult<()> {
        self.ensure_cluster_id().await?;
        if key.is_empty() {
            return Err(CoordError::Watch("empty watch key".to_string()));
        }
        if notify.is_closed() {
            return Err(CoordError::Watch(format!("receiver for {} already closed", key)));
        }

        // Subscribe before reading the current leader so nothing published
        // in between is lost.
        let mut events = self.leader_events.subscribe();
        let current = self.cluster_leaders.read().await.get(key).cloned();
        let key = key.to_string();
        let active = self.active_watches.clone();
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut stop = stop;

            let mut receiver_alive = true;
            if let Some(leader) = current {
                receiver_alive = notify.send(leader).await.is_ok();
            }

            while receiver_alive {
                tokio::select! {
                    _ = &mut stop => {
                        debug!(key = %key, "Cluster leader watch stopped");
                        break;
                    }
                    _ = notify.closed() => break,
                    event = events.recv() => match event {
                        Ok((event_key, leader)) => {
                            if event_key != key {
                                continue;
                            }
                            if notify.send(leader).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(key = %key, skipped, "Cluster leader watch lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            active.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(())
    }
}
