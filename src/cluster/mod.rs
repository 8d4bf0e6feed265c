//! Partition leadership coordination.
//!
//! Leadership of every (topic, partition) is granted by a strongly-consistent
//! [`LeadershipBackend`]. Each data node runs a [`NodeCoordinator`] that
//! registers with the backend, acquires the partitions it hosts, and pushes
//! new leader sessions to the partition's in-sync replicas over RPC.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐        acquire / release / watch       ┌────────────────────┐
//!   │ NodeCoordinator  │ ─────────────────────────────────────▶ │ LeadershipBackend  │
//!   │  (node A, leader)│ ◀───────── session, topic info ─────── │ (consensus store)  │
//!   └────────┬─────────┘                                        └────────────────────┘
//!            │ UpdateTopicLeaderSession (RPC)
//!            ▼
//!   ┌──────────────────┐
//!   │ NodeCoordinator  │  fences sessions older than the one it holds
//!   │  (node B, ISR)   │
//!   └──────────────────┘
//! ```
//!
//! # Fencing
//!
//! Every grant bumps the partition's leader epoch and mints a session token
//! `<leader id><epoch>`. Nodes reject sessions with an older epoch, and
//! sessions with the current epoch but a different token, so a deposed leader
//! cannot overwrite the view of a newer one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use partcoord::cluster::{LeadershipBackend, NodeCoordinator};
//! use partcoord::config::CoordinatorConfig;
//!
//! async fn run(backend: Arc<dyn LeadershipBackend>) -> Result<(), Box<dyn std::error::Error>> {
//!     let node = NodeCoordinator::new(CoordinatorConfig::from_env()?, backend);
//!     node.start().await?;
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

mod error;
pub mod metrics;
mod node_coordinator;
pub mod retry;
mod topic_coordinator;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_leadership;

pub use error::{CoordError, CoordResult};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_leadership::InMemoryLeadership;
pub use node_coordinator::NodeCoordinator;
pub use topic_coordinator::{LeadershipState, TopicCoordinator};
pub use traits::LeadershipBackend;
