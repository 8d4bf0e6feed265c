//! Core value types shared by the backend, the coordinator and the RPC layer.
//!
//! - [`NodeIdentity`]: immutable descriptor of a cluster member
//! - [`Epoch`]: monotonically increasing fencing counter
//! - [`TopicPartitionMetaInfo`]: backend-owned replication view of a partition
//! - [`TopicLeaderSession`]: current leader plus its fencing token

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Key for per-partition maps: `(topic, partition)`.
///
/// Uses `Arc<str>` so keys can be cloned into background tasks cheaply.
pub type PartitionKey = (Arc<str>, i32);

/// Build a [`PartitionKey`] from borrowed parts.
pub fn partition_key(topic: &str, partition: i32) -> PartitionKey {
    (Arc::from(topic), partition)
}

/// Immutable identity of a cluster member.
///
/// The `id` is derived once at construction as `address:rpc_port:extra_id`
/// and is the key used for registration and ISR membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    id: String,
    address: String,
    rpc_port: u16,
    extra_id: String,
}

impl NodeIdentity {
    pub fn new(address: impl Into<String>, rpc_port: u16, extra_id: impl Into<String>) -> Self {
        let address = address.into();
        let extra_id = extra_id.into();
        let id = format!("{}:{}:{}", address, rpc_port, extra_id);
        Self {
            id,
            address,
            rpc_port,
            extra_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn extra_id(&self) -> &str {
        &self.extra_id
    }

    /// Socket address peers use to reach this node's RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.address, self.rpc_port)
    }

    /// An identity needs an address to be reachable and registrable.
    pub fn is_well_formed(&self) -> bool {
        !self.address.is_empty()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A leadership or metadata epoch.
///
/// Epochs start at 0 (never led) and are bumped by one on every leadership
/// change. They never decrease for the lifetime of a partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const ZERO: Self = Epoch(0);

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The epoch that follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Epoch(value)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable, backend-owned replication view of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPartitionMetaInfo {
    pub name: String,
    pub partition: i32,
    /// Id of the current leader, empty when the partition is unleased.
    pub leader: String,
    /// In-sync replica ids. Order is irrelevant, entries are unique.
    pub isr: Vec<String>,
    pub epoch: Epoch,
}

impl TopicPartitionMetaInfo {
    pub fn new(name: impl Into<String>, partition: i32) -> Self {
        Self {
            name: name.into(),
            partition,
            ..Default::default()
        }
    }

    pub fn has_leader(&self) -> bool {
        !self.leader.is_empty()
    }

    pub fn is_in_isr(&self, node_id: &str) -> bool {
        self.isr.iter().any(|id| id == node_id)
    }

    /// Add a node to the ISR if it is not already a member.
    pub fn join_isr(&mut self, node_id: &str) {
        if !self.is_in_isr(node_id) {
            self.isr.push(node_id.to_string());
        }
    }
}

/// Session of the current partition leader.
///
/// The `session` string is the fencing credential peers compare against;
/// it is always `leader_node.id` followed by the decimal `leader_epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLeaderSession {
    pub leader_node: Option<NodeIdentity>,
    pub leader_epoch: Epoch,
    pub session: String,
}

impl TopicLeaderSession {
    /// Create a session for `leader` at `epoch`, deriving the token.
    pub fn new(leader: NodeIdentity, epoch: Epoch) -> Self {
        let session = session_token(leader.id(), epoch);
        Self {
            leader_node: Some(leader),
            leader_epoch: epoch,
            session,
        }
    }

    pub fn has_leader(&self) -> bool {
        self.leader_node.is_some()
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_node.as_ref().map(NodeIdentity::id)
    }

    /// True if both the leader id and the epoch match.
    pub fn is_same(&self, other: &TopicLeaderSession) -> bool {
        self.leader_id() == other.leader_id() && self.leader_epoch == other.leader_epoch
    }
}

/// Derive the fencing token for a leader id and epoch.
///
/// No delimiter is used; the token is `<leader_id><epoch>`.
pub fn session_token(leader_id: &str, epoch: Epoch) -> String {
    format!("{}{}", leader_id, epoch)
}
