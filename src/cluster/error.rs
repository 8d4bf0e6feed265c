//! Error types for partition coordination.
//!
//! # Error Handling Patterns
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! - Binding the RPC server and registering the node at startup
//! - Leadership acquisition and release against the backend
//! - Applying a leader session that fails fencing
//!
//! ## Best-Effort (Log and Continue)
//!
//! - Propagating a new leader session to ISR peers
//! - Re-running acquisition after a cluster-leader notification
//! - Unregistering and releasing during shutdown
//!
//! # Contention vs. Unreachable
//!
//! Callers distinguish backend contention ([`CoordError::is_contention`], try
//! again later) from peers that stayed unreachable after every RPC retry
//! ([`CoordError::is_unreachable`], treat the node as down).

use thiserror::Error;

use crate::rpc::{CoordErrType, RpcCallError, RpcErrCode, RpcError};
use crate::types::Epoch;

/// Result type for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors produced by the leadership backend and the node coordinator.
#[derive(Debug, Error)]
pub enum CoordError {
    /// Another node holds leadership of the partition.
    #[error("topic leader already exist for {topic}/{partition}: {leader}")]
    LeaderAlreadyExists {
        topic: String,
        partition: i32,
        leader: String,
    },

    /// No coordinator was ever created for the partition.
    #[error("topic not exist: {topic}/{partition}")]
    TopicNotExist { topic: String, partition: i32 },

    /// Backend used before `init_cluster_id`.
    #[error("cluster id not initialized")]
    ClusterIdNotSet,

    /// Node identity cannot be registered.
    #[error("invalid node identity: {0}")]
    InvalidNode(String),

    /// The partition exists but nobody holds its leadership.
    #[error("no leader for {topic}/{partition}")]
    NoLeader { topic: String, partition: i32 },

    /// Incoming leader session is older than the one already known.
    #[error("stale leader epoch for {topic}/{partition}: current {current}, got {received}")]
    StaleEpoch {
        topic: String,
        partition: i32,
        current: Epoch,
        received: Epoch,
    },

    /// Same epoch, different session token.
    #[error("leader session mismatch for {topic}/{partition}: expected {expected}, got {received}")]
    SessionMismatch {
        topic: String,
        partition: i32,
        expected: String,
        received: String,
    },

    /// Local state machine transition not allowed from the current state.
    #[error("invalid leadership transition for {topic}/{partition}: {from} -> {to}")]
    InvalidTransition {
        topic: String,
        partition: i32,
        from: &'static str,
        to: &'static str,
    },

    /// Watch subscription could not be established.
    #[error("watch error: {0}")]
    Watch(String),

    /// Backend-specific failure (connection to the coordination store etc).
    #[error("leadership backend error: {0}")]
    Backend(String),

    /// Node coordinator started twice.
    #[error("node coordinator already started")]
    AlreadyStarted,

    /// Operation requires a started node coordinator.
    #[error("node coordinator not started")]
    NotStarted,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// RPC failure talking to a peer.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcCallError),

    /// IO error (e.g. binding the RPC listener).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// Another node won the race; retry acquisition later.
    pub fn is_contention(&self) -> bool {
        matches!(self, CoordError::LeaderAlreadyExists { .. })
    }

    /// A peer could not be reached even after retrying.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, CoordError::Rpc(e) if e.is_unreachable())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::TopicNotExist { .. })
    }

    /// The error came from epoch/session fencing.
    pub fn is_fenced(&self) -> bool {
        matches!(
            self,
            CoordError::StaleEpoch { .. } | CoordError::SessionMismatch { .. }
        )
    }

    /// Whether repeating the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            CoordError::Backend(_) | CoordError::Io(_) => true,
            CoordError::Rpc(e) => e.is_transport(),
            _ => false,
        }
    }

    /// Map to the error envelope returned to RPC callers.
    pub fn to_rpc_error(&self) -> RpcError {
        let (code, err_type) = match self {
            CoordError::LeaderAlreadyExists { .. } => {
                (RpcErrCode::NotTopicLeader, CoordErrType::ElectionTmp)
            }
            CoordError::TopicNotExist { .. } => (RpcErrCode::TopicNotExist, CoordErrType::Local),
            CoordError::NoLeader { .. } => (RpcErrCode::NoLeader, CoordErrType::ElectionTmp),
            CoordError::InvalidNode(_) => (RpcErrCode::Common, CoordErrType::Sender),
            CoordError::StaleEpoch { .. } => {
                (RpcErrCode::EpochLessThanCurrent, CoordErrType::Election)
            }
            CoordError::SessionMismatch { .. } => {
                (RpcErrCode::SessionMismatch, CoordErrType::Election)
            }
            CoordError::Rpc(e) => return e.to_rpc_error(),
            CoordError::NotStarted => (RpcErrCode::Closing, CoordErrType::Tmp),
            _ => (RpcErrCode::Common, CoordErrType::Common),
        };
        RpcError::new(code, self.to_string(), err_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_distinguishable_from_unreachable() {
        let contention = CoordError::LeaderAlreadyExists {
            topic: "t".into(),
            partition: 0,
            leader: "n1".into(),
        };
        assert!(contention.is_contention());
        assert!(!contention.is_unreachable());

        let unreachable = CoordError::from(RpcCallError::Exhausted {
            method: "NodeCoordinator.UpdateTopicLeaderSession".into(),
            attempts: 4,
            source: Box::new(RpcCallError::Timeout {
                addr: "127.0.0.1:1".into(),
                timeout_ms: 100,
            }),
        });
        assert!(unreachable.is_unreachable());
        assert!(!unreachable.is_contention());
    }

    #[test]
    fn test_fencing_errors_map_to_election_envelope() {
        let err = CoordError::StaleEpoch {
            topic: "t".into(),
            partition: 1,
            current: Epoch(3),
            received: Epoch(2),
        };
        assert!(err.is_fenced());
        let env = err.to_rpc_error();
        assert_eq!(env.err_code, RpcErrCode::EpochLessThanCurrent);
        assert_eq!(env.err_type, CoordErrType::Election);
        assert!(env.err_msg.contains("current 3"));
    }

    #[test]
    fn test_not_found_message() {
        let err = CoordError::TopicNotExist {
            topic: "orders".into(),
            partition: 2,
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "topic not exist: orders/2");
        assert_eq!(err.to_rpc_error().err_code, RpcErrCode::TopicNotExist);
    }

    #[test]
    fn test_retriable_classification() {
        assert!(CoordError::Backend("store unavailable".into()).is_retriable());
        assert!(!CoordError::ClusterIdNotSet.is_retriable());
        assert!(
            !CoordError::LeaderAlreadyExists {
                topic: "t".into(),
                partition: 0,
                leader: "n".into()
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_leaderless_and_inconsistent_envelopes() {
        let no_leader = CoordError::NoLeader {
            topic: "orders".into(),
            partition: 0,
        }
        .to_rpc_error();
        assert_eq!(no_leader.err_code, RpcErrCode::NoLeader);
        assert_eq!(no_leader.err_type, CoordErrType::ElectionTmp);

        let invalid = CoordError::InvalidNode("leader not in isr".into()).to_rpc_error();
        assert!(invalid.is_failure());
        assert_eq!(invalid.err_type, CoordErrType::Sender);
    }
}
