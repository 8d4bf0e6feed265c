//! Node coordinator: the per-node orchestrator.
//!
//! Owns this node's RPC server, its registration with the leadership backend,
//! the cluster-leader watch, and the local view of every partition it has
//! seen. Partition leadership is only ever granted by the backend; the node
//! coordinator applies the granted session locally and pushes it to the
//! partition's ISR peers.
//!
//! # Lifecycle
//!
//! ```text
//! new ──start──▶ running ──stop──▶ stopped
//! ```
//!
//! `start` binds the server, registers, opens the watch and acquires the
//! hosted partitions. `stop` reverses it and is safe to call repeatedly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::error::{CoordError, CoordResult};
use super::metrics::{
    FENCING_REJECTIONS, LEADER_ACQUISITIONS, LEADER_RELEASES, SESSION_PROPAGATIONS, WATCH_EVENTS,
    record_leader_epoch,
};
use super::retry::with_backend_policy;
use super::topic_coordinator::{LeadershipState, TopicCoordinator};
use super::traits::LeadershipBackend;
use crate::config::CoordinatorConfig;
use crate::constants::{
    COORDINATOR_SERVICE, METHOD_GET_TOPIC_INFO, METHOD_GET_TOPIC_LEADER_SESSION,
    METHOD_TEST_RPC_CALL, METHOD_UPDATE_TOPIC_LEADER_SESSION, WATCH_CHANNEL_CAPACITY,
};
use crate::rpc::codec::decode_body;
use crate::rpc::{
    DispatchError, HandlerReply, LeaderSessionReply, NodeRpcClient, RpcCallError, RpcHandler,
    RpcServer, TopicPartitionRequest, UpdateLeaderSessionRequest, echo_envelope,
};
use crate::types::{
    NodeIdentity, PartitionKey, TopicLeaderSession, TopicPartitionMetaInfo, partition_key,
};

/// Per-node orchestrator of partition leadership.
pub struct NodeCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    backend: Arc<dyn LeadershipBackend>,
    /// Set once the server is bound and the port is known.
    identity: RwLock<Option<NodeIdentity>>,
    coordinators: RwLock<HashMap<PartitionKey, TopicCoordinator>>,
    cluster_leader: RwLock<Option<NodeIdentity>>,
    shutdown_tx: broadcast::Sender<()>,
    watch_stop: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for NodeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCoordinator")
            .field("config", &self.inner.config)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl NodeCoordinator {
    pub fn new(config: CoordinatorConfig, backend: Arc<dyn LeadershipBackend>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                identity: RwLock::new(None),
                coordinators: RwLock::new(HashMap::new()),
                cluster_leader: RwLock::new(None),
                shutdown_tx,
                watch_stop: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Bring the node into the cluster.
    ///
    /// Bind and registration failures are fatal and leave the coordinator
    /// unstarted. Failing to acquire a hosted partition is not: the watch
    /// loop retries it on the next cluster-leader change.
    pub async fn start(&self) -> CoordResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CoordError::AlreadyStarted);
        }

        if let Err(e) = self.start_services().await {
            let _ = self.inner.shutdown_tx.send(());
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        for (topic, partition) in &self.inner.config.hosted_partitions {
            if let Err(e) = self.try_acquire_partition(topic, *partition).await {
                warn!(topic = %topic, partition, error = %e, "Initial partition acquisition failed");
            }
        }
        Ok(())
    }

    async fn start_services(&self) -> CoordResult<()> {
        let inner = &self.inner;
        inner
            .config
            .validate()
            .map_err(|errors| CoordError::Config(errors.join("; ")))?;

        let bind_addr = format!("{}:{}", inner.config.node_address, inner.config.rpc_port);
        let handler: Arc<dyn RpcHandler> = inner.clone();
        let server = RpcServer::bind(&bind_addr, handler).await?;

        let identity = NodeIdentity::new(
            inner.config.node_address.clone(),
            server.local_addr().port(),
            inner.config.extra_id.clone(),
        );
        inner.backend.init_cluster_id(&inner.config.cluster_id).await;
        with_backend_policy(
            || inner.backend.register(&identity),
            CoordError::is_retriable,
        )
        .await?;
        *inner.identity.write().await = Some(identity.clone());

        let server_task = tokio::spawn(server.run(inner.shutdown_tx.subscribe()));

        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        if let Err(e) = inner
            .backend
            .watch_cluster_leader(&inner.config.watch_key, event_tx, stop_rx)
            .await
        {
            let _ = inner.backend.unregister(&identity).await;
            return Err(e);
        }
        *inner.watch_stop.lock().await = Some(stop_tx);

        let watch_task = tokio::spawn(
            inner
                .clone()
                .run_watch_loop(event_rx, inner.shutdown_tx.subscribe()),
        );

        inner.tasks.lock().await.extend([server_task, watch_task]);
        info!(node = %identity, cluster = %inner.config.cluster_id, "Node coordinator started");
        Ok(())
    }

    /// Leave the cluster: stop the watch, release owned partitions, unregister,
    /// and stop the server. Calling it again, or before `start`, does nothing.
    pub async fn stop(&self) -> CoordResult<()> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) || inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(stop_tx) = inner.watch_stop.lock().await.take() {
            let _ = stop_tx.send(());
        }

        let owned: Vec<(String, i32)> = inner
            .coordinators
            .read()
            .await
            .values()
            .filter(|tc| tc.state() == LeadershipState::Leading)
            .map(|tc| (tc.topic().to_string(), tc.partition()))
            .collect();
        for (topic, partition) in owned {
            if let Err(e) = self.release_partition(&topic, partition).await {
                warn!(topic = %topic, partition, error = %e, "Failed to release partition on stop");
            }
        }

        let identity = inner.identity.read().await.clone();
        if let Some(identity) = identity {
            let unregistered = with_backend_policy(
                || inner.backend.unregister(&identity),
                CoordError::is_retriable,
            )
            .await;
            if let Err(e) = unregistered {
                warn!(node = %identity, error = %e, "Failed to unregister node");
            }
        }

        let _ = inner.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Node coordinator stopped");
        Ok(())
    }

    /// Ask the backend for leadership of a partition.
    ///
    /// Returns `Ok(true)` when this node became leader and `Ok(false)` when
    /// another node holds it; in the latter case the local replication view
    /// is refreshed from the backend.
    pub async fn try_acquire_partition(&self, topic: &str, partition: i32) -> CoordResult<bool> {
        self.inner.try_acquire_partition(topic, partition).await
    }

    /// Give up leadership of a partition this node leads.
    pub async fn release_partition(&self, topic: &str, partition: i32) -> CoordResult<()> {
        let inner = &self.inner;
        let key = partition_key(topic, partition);

        inner
            .with_coordinator(&key, |tc| tc.begin_release())
            .await?;

        if let Err(e) = inner.backend.release_topic_leader(topic, partition).await {
            let _ = inner
                .with_coordinator(&key, |tc| {
                    tc.abort_release();
                    Ok(())
                })
                .await;
            return Err(e);
        }

        inner
            .with_coordinator(&key, |tc| tc.finish_release())
            .await?;
        LEADER_RELEASES.inc();
        info!(topic, partition, "Released partition leadership");
        Ok(())
    }

    /// Record that this node's copy of the partition data is ready to serve.
    pub async fn mark_local_data_loaded(&self, topic: &str, partition: i32) -> CoordResult<()> {
        self.inner
            .with_coordinator(&partition_key(topic, partition), |tc| {
                tc.mark_local_data_loaded();
                Ok(())
            })
            .await
    }

    pub async fn leader_session(&self, topic: &str, partition: i32) -> Option<TopicLeaderSession> {
        self.inner
            .coordinators
            .read()
            .await
            .get(&partition_key(topic, partition))
            .map(|tc| tc.leader_session().clone())
    }

    /// Snapshot of the local coordinator for a partition.
    pub async fn topic_coordinator(&self, topic: &str, partition: i32) -> Option<TopicCoordinator> {
        self.inner
            .coordinators
            .read()
            .await
            .get(&partition_key(topic, partition))
            .cloned()
    }

    /// Most recent cluster leader delivered by the watch.
    pub async fn cluster_leader(&self) -> Option<NodeIdentity> {
        self.inner.cluster_leader.read().await.clone()
    }

    pub async fn identity(&self) -> Option<NodeIdentity> {
        self.inner.identity.read().await.clone()
    }

    /// `"<address>:<port>"` of the running RPC server.
    pub async fn rpc_addr(&self) -> Option<String> {
        self.identity().await.map(|identity| identity.rpc_addr())
    }
}

impl Inner {
    async fn local_identity(&self) -> CoordResult<NodeIdentity> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or(CoordError::NotStarted)
    }

    async fn with_coordinator<T>(
        &self,
        key: &PartitionKey,
        f: impl FnOnce(&mut TopicCoordinator) -> CoordResult<T>,
    ) -> CoordResult<T> {
        let mut coordinators = self.coordinators.write().await;
        let tc = coordinators
            .get_mut(key)
            .ok_or_else(|| CoordError::TopicNotExist {
                topic: key.0.to_string(),
                partition: key.1,
            })?;
        f(tc)
    }

    async fn try_acquire_partition(&self, topic: &str, partition: i32) -> CoordResult<bool> {
        let node = self.local_identity().await?;

        let session = match self.backend.acquire_topic_leader(topic, partition, &node).await {
            Ok(session) => session,
            Err(e) if e.is_contention() => {
                LEADER_ACQUISITIONS.with_label_values(&["contended"]).inc();
                debug!(topic, partition, error = %e, "Partition already led elsewhere");
                self.refresh_topic_info(topic, partition).await;
                return Ok(false);
            }
            Err(e) => {
                LEADER_ACQUISITIONS.with_label_values(&["failed"]).inc();
                return Err(e);
            }
        };

        let topic_info = match self.adopt_granted_session(topic, partition, &node, &session).await {
            Ok(topic_info) => topic_info,
            Err(e) => {
                LEADER_ACQUISITIONS.with_label_values(&["failed"]).inc();
                warn!(topic, partition, error = %e, "Cannot adopt granted leadership, releasing it");
                self.release_granted(topic, partition, &node).await;
                return Err(e);
            }
        };
        LEADER_ACQUISITIONS.with_label_values(&["acquired"]).inc();
        info!(
            topic,
            partition,
            epoch = %session.leader_epoch,
            isr = ?topic_info.isr,
            "Acquired partition leadership"
        );

        let request = UpdateLeaderSessionRequest {
            topic_info,
            leader_session: session,
        };
        self.propagate_leader_session(&node, request).await;
        Ok(true)
    }

    async fn adopt_granted_session(
        &self,
        topic: &str,
        partition: i32,
        node: &NodeIdentity,
        session: &TopicLeaderSession,
    ) -> CoordResult<TopicPartitionMetaInfo> {
        let topic_info = self.backend.get_topic_info(topic, partition).await?;
        self.apply_leader_session(topic_info.clone(), session.clone(), node.id())
            .await?;
        Ok(topic_info)
    }

    /// Give back a grant this node could not adopt, unless the backend
    /// already shows another leader.
    async fn release_granted(&self, topic: &str, partition: i32, node: &NodeIdentity) {
        if let Ok(info) = self.backend.get_topic_info(topic, partition).await {
            if info.leader != node.id() {
                return;
            }
        }
        if let Err(e) = self.backend.release_topic_leader(topic, partition).await {
            warn!(topic, partition, error = %e, "Failed to release unadopted leadership");
        }
    }

    async fn refresh_topic_info(&self, topic: &str, partition: i32) {
        match self.backend.get_topic_info(topic, partition).await {
            Ok(topic_info) => {
                self.coordinators
                    .write()
                    .await
                    .entry(partition_key(topic, partition))
                    .or_insert_with(|| TopicCoordinator::new(topic, partition))
                    .refresh_topic_info(topic_info);
            }
            Err(e) => warn!(topic, partition, error = %e, "Failed to refresh topic info"),
        }
    }

    async fn apply_leader_session(
        &self,
        topic_info: TopicPartitionMetaInfo,
        session: TopicLeaderSession,
        local_id: &str,
    ) -> CoordResult<()> {
        let topic = topic_info.name.clone();
        let partition = topic_info.partition;
        let epoch = session.leader_epoch;

        self.coordinators
            .write()
            .await
            .entry(partition_key(&topic, partition))
            .or_insert_with(|| TopicCoordinator::new(&topic, partition))
            .apply_leader_session(topic_info, session, local_id)?;

        record_leader_epoch(&topic, partition, epoch.value());
        Ok(())
    }

    /// Push the leader session to every ISR member except `leader`.
    ///
    /// Best effort: unreachable or unregistered peers are logged and counted,
    /// and catch up on their next query.
    async fn propagate_leader_session(&self, leader: &NodeIdentity, request: UpdateLeaderSessionRequest) {
        let peers: Vec<String> = request
            .topic_info
            .isr
            .iter()
            .filter(|id| id.as_str() != leader.id())
            .cloned()
            .collect();
        if peers.is_empty() {
            return;
        }

        let registered: HashMap<String, NodeIdentity> = match self.backend.registered_nodes().await {
            Ok(nodes) => nodes
                .into_iter()
                .map(|node| (node.id().to_string(), node))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Cannot resolve ISR peers for session propagation");
                SESSION_PROPAGATIONS
                    .with_label_values(&["unresolved"])
                    .inc_by(peers.len() as u64);
                return;
            }
        };

        let request = Arc::new(request);
        let mut sends = JoinSet::new();
        for peer_id in peers {
            let Some(peer) = registered.get(&peer_id).cloned() else {
                warn!(peer = %peer_id, "ISR peer is not registered, skipping");
                SESSION_PROPAGATIONS.with_label_values(&["unresolved"]).inc();
                continue;
            };
            let request = request.clone();
            let config = self.config.clone();
            sends.spawn(async move {
                let result = send_leader_session(&peer, &request, &config).await;
                (peer, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((peer, Ok(()))) => {
                    SESSION_PROPAGATIONS.with_label_values(&["ok"]).inc();
                    debug!(peer = %peer, "Propagated leader session");
                }
                Ok((peer, Err(e))) => {
                    SESSION_PROPAGATIONS.with_label_values(&["failed"]).inc();
                    warn!(peer = %peer, error = %e, "Failed to propagate leader session");
                }
                Err(e) => {
                    SESSION_PROPAGATIONS.with_label_values(&["failed"]).inc();
                    warn!(error = %e, "Session propagation task failed");
                }
            }
        }
    }

    /// React to cluster-leader changes until the watch ends or shutdown fires.
    async fn run_watch_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<NodeIdentity>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => {
                    let Some(leader) = event else {
                        debug!("Cluster leader watch closed");
                        break;
                    };
                    WATCH_EVENTS.inc();
                    info!(leader = %leader, "Cluster leader changed");
                    *self.cluster_leader.write().await = Some(leader);
                    self.acquire_unled_partitions().await;
                }
            }
        }
    }

    async fn acquire_unled_partitions(&self) {
        for (topic, partition) in &self.config.hosted_partitions {
            // A peer's session seen locally may already be released; only
            // the backend decides whether someone else still leads.
            let leading = self
                .coordinators
                .read()
                .await
                .get(&partition_key(topic, *partition))
                .is_some_and(|tc| tc.state() == LeadershipState::Leading);
            if leading {
                continue;
            }
            if let Err(e) = self.try_acquire_partition(topic, *partition).await {
                warn!(topic = %topic, partition, error = %e, "Partition acquisition failed");
            }
        }
    }

    async fn lookup<T>(
        &self,
        request: &TopicPartitionRequest,
        f: impl FnOnce(&TopicCoordinator) -> T,
    ) -> CoordResult<T> {
        self.coordinators
            .read()
            .await
            .get(&partition_key(&request.topic, request.partition))
            .map(f)
            .ok_or_else(|| CoordError::TopicNotExist {
                topic: request.topic.clone(),
                partition: request.partition,
            })
    }

    async fn handle_update_leader_session(&self, request: UpdateLeaderSessionRequest) -> Option<CoordError> {
        let local_id = self
            .identity
            .read()
            .await
            .as_ref()
            .map(|identity| identity.id().to_string())
            .unwrap_or_default();
        let topic = request.topic_info.name.clone();
        let partition = request.topic_info.partition;
        let epoch = request.leader_epoch();

        match self
            .apply_leader_session(request.topic_info, request.leader_session, &local_id)
            .await
        {
            Ok(()) => {
                debug!(topic = %topic, partition, epoch = %epoch, "Adopted propagated leader session");
                None
            }
            Err(e) => {
                let reason = match &e {
                    CoordError::StaleEpoch { .. } => "stale_epoch",
                    CoordError::SessionMismatch { .. } => "session_mismatch",
                    CoordError::InvalidNode(_) => "inconsistent_view",
                    _ => "other",
                };
                FENCING_REJECTIONS.with_label_values(&[reason]).inc();
                warn!(topic = %topic, partition, epoch = %epoch, error = %e, "Rejected leader session");
                Some(e)
            }
        }
    }
}

async fn send_leader_session(
    peer: &NodeIdentity,
    request: &UpdateLeaderSessionRequest,
    config: &CoordinatorConfig,
) -> Result<(), RpcCallError> {
    let client = NodeRpcClient::connect(&peer.rpc_addr(), config.rpc_timeout)
        .await?
        .with_retry_policy(config.rpc_max_retries, config.rpc_retry_delay);
    client.update_topic_leader_session(request).await
}

fn decode_request<T: DeserializeOwned>(method: &str, body: &[u8]) -> Result<T, DispatchError> {
    decode_body(body).map_err(|e| DispatchError::BadRequest {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn encode_reply<T: Serialize>(
    method: &str,
    value: &T,
    error: Option<CoordError>,
) -> Result<HandlerReply, DispatchError> {
    HandlerReply::new(value, error.map(|e| e.to_rpc_error())).map_err(|e| {
        DispatchError::BadRequest {
            method: method.to_string(),
            reason: e.to_string(),
        }
    })
}

#[async_trait]
impl RpcHandler for Inner {
    fn service_name(&self) -> &str {
        COORDINATOR_SERVICE
    }

    async fn handle(&self, method: &str, body: &[u8]) -> Result<HandlerReply, DispatchError> {
        match method {
            METHOD_TEST_RPC_CALL => {
                let payload: String = decode_request(method, body)?;
                HandlerReply::new(&payload, Some(echo_envelope(&payload))).map_err(|e| {
                    DispatchError::BadRequest {
                        method: method.to_string(),
                        reason: e.to_string(),
                    }
                })
            }
            METHOD_GET_TOPIC_LEADER_SESSION => {
                let request: TopicPartitionRequest = decode_request(method, body)?;
                match self
                    .lookup(&request, |tc| LeaderSessionReply {
                        leader_session: tc.leader_session().clone(),
                        servable: tc.is_servable_leader(),
                    })
                    .await
                {
                    Ok(reply) if !reply.leader_session.has_leader() => {
                        let no_leader = CoordError::NoLeader {
                            topic: request.topic.clone(),
                            partition: request.partition,
                        };
                        encode_reply(method, &reply, Some(no_leader))
                    }
                    Ok(reply) => encode_reply(method, &reply, None),
                    Err(e) => encode_reply(method, &LeaderSessionReply::default(), Some(e)),
                }
            }
            METHOD_GET_TOPIC_INFO => {
                let request: TopicPartitionRequest = decode_request(method, body)?;
                match self.lookup(&request, |tc| tc.topic_info().clone()).await {
                    Ok(info) => encode_reply(method, &info, None),
                    Err(e) => encode_reply(
                        method,
                        &TopicPartitionMetaInfo::new(request.topic.clone(), request.partition),
                        Some(e),
                    ),
                }
            }
            METHOD_UPDATE_TOPIC_LEADER_SESSION => {
                let request: UpdateLeaderSessionRequest = decode_request(method, body)?;
                let rejection = self.handle_update_leader_session(request).await;
                encode_reply(method, &(), rejection)
            }
            other => Err(DispatchError::MethodNotFound(format!(
                "{}.{}",
                COORDINATOR_SERVICE, other
            ))),
        }
    }
}
