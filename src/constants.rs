//! Centralized coordination and RPC constants.
//!
//! # Categories
//!
//! - **RPC Constants**: service naming, framing limits, timeouts
//! - **Retry Constants**: default bounds for `call_with_retry`
//! - **Watch Constants**: cluster-leader subscription defaults

use std::time::Duration;

// =============================================================================
// RPC Constants
// =============================================================================

/// Service name under which the node coordinator registers its RPC methods.
///
/// Methods are addressed as `"<service>.<method>"`.
pub const COORDINATOR_SERVICE: &str = "NodeCoordinator";

/// Diagnostic echo method. Returns the payload and a populated error envelope.
pub const METHOD_TEST_RPC_CALL: &str = "TestRpcCall";

/// Query the local leader session for a partition.
pub const METHOD_GET_TOPIC_LEADER_SESSION: &str = "GetTopicLeaderSession";

/// Query the local partition metadata view.
pub const METHOD_GET_TOPIC_INFO: &str = "GetTopicInfo";

/// Propagate a new leader session from the partition leader to ISR members.
pub const METHOD_UPDATE_TOPIC_LEADER_SESSION: &str = "UpdateTopicLeaderSession";

/// Maximum size of a single RPC frame (16 MiB).
///
/// Frames larger than this are rejected before allocation.
pub const MAX_RPC_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause after a failed `accept()` before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Default listen address for the RPC server.
pub const DEFAULT_NODE_ADDRESS: &str = "127.0.0.1";

// =============================================================================
// Retry Constants
// =============================================================================

/// Default number of retries after the first attempt for transport failures.
pub const DEFAULT_RPC_MAX_RETRIES: usize = 3;

/// Default minimum delay between RPC attempts.
pub const DEFAULT_RPC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the exponential RPC backoff.
pub const MAX_RPC_RETRY_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Watch Constants
// =============================================================================

/// Default key for the cluster-leader watch subscription.
pub const DEFAULT_WATCH_KEY: &str = "cluster-leader";

/// Capacity of the cluster-leader notification channel.
pub const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Default cluster identifier.
pub const DEFAULT_CLUSTER_ID: &str = "partcoord-cluster";
