//! # partcoord
//! Partition leadership coordination for message-queue data nodes.
//!
//! A cluster of data nodes shares a set of (topic, partition) pairs. For each
//! partition exactly one node leads at a time, a set of in-sync replicas (ISR)
//! follows it, and a monotonically increasing epoch fences out leaders that
//! have been replaced. This crate provides:
//!
//! - the [`LeadershipBackend`](cluster::LeadershipBackend) contract a
//!   strongly-consistent store implements to grant leadership atomically;
//! - the per-node [`NodeCoordinator`](cluster::NodeCoordinator), which
//!   registers the node, acquires its partitions, watches for cluster-leader
//!   changes and propagates leader sessions to ISR peers;
//! - a framed node-to-node [RPC layer](rpc) with a retrying client.
//!
//! Storage of message data and a production backend are out of scope; an
//! in-memory backend is available with the `test-utilities` feature.
//!
//! ## Getting started
//! ```rust,no_run
//! use std::sync::Arc;
//! use partcoord::prelude::*;
//!
//! async fn run(backend: Arc<dyn LeadershipBackend>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     init_logging(LogFormat::from_env())?;
//!
//!     let config = CoordinatorConfig {
//!         hosted_partitions: vec![("orders".to_string(), 0)],
//!         ..CoordinatorConfig::default()
//!     };
//!     let node = NodeCoordinator::new(config, backend);
//!     node.start().await?;
//!
//!     let session = node.leader_session("orders", 0).await;
//!     println!("{:?}", session);
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod constants;
pub mod rpc;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Commonly used types.
    #[cfg(any(test, feature = "test-utilities"))]
    pub use crate::cluster::InMemoryLeadership;
    pub use crate::cluster::{
        CoordError, CoordResult, LeadershipBackend, LeadershipState, NodeCoordinator,
        TopicCoordinator,
    };
    pub use crate::config::CoordinatorConfig;
    pub use crate::rpc::{CoordErrType, NodeRpcClient, RpcCallError, RpcErrCode, RpcError};
    pub use crate::telemetry::{LogFormat, init_logging};
    pub use crate::types::{Epoch, NodeIdentity, TopicLeaderSession, TopicPartitionMetaInfo};
}
