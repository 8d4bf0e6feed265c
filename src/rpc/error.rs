//! RPC error types.
//!
//! Two layers of errors travel through the RPC subsystem:
//!
//! - [`RpcError`]: the application-level envelope a remote method returns
//!   *alongside* its response value. It is data, not a transport failure.
//! - [`RpcCallError`]: why a call did not produce a response at all
//!   (transport failure, dispatch rejection, codec failure, exhausted retries).
//!
//! Only transport failures are retried by
//! [`NodeRpcClient::call_with_retry`](super::NodeRpcClient::call_with_retry).

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error code carried in an [`RpcError`].
///
/// Encoded as `i32` on the wire. Codes this build does not know decode to
/// [`RpcErrCode::Common`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
#[repr(i32)]
pub enum RpcErrCode {
    #[default]
    NoErr = 0,
    Common = 1,
    /// The receiver is not the leader for the partition.
    NotTopicLeader = 2,
    /// The partition has no leader.
    NoLeader = 3,
    /// The sender's epoch is older than the receiver's.
    EpochLessThanCurrent = 5,
    /// The session token does not match the current leader session.
    SessionMismatch = 6,
    /// No coordinator exists for the partition.
    TopicNotExist = 7,
    /// The receiver is shutting down.
    Closing = 8,
}

impl From<i32> for RpcErrCode {
    fn from(code: i32) -> Self {
        RpcErrCode::from_i32(code).unwrap_or(RpcErrCode::Common)
    }
}

impl From<RpcErrCode> for i32 {
    fn from(code: RpcErrCode) -> Self {
        code as i32
    }
}

/// Category of a coordination error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoordErrType {
    #[default]
    NoErr,
    /// Generic error; also used by the diagnostic echo.
    Common,
    /// Network or transport failure.
    Net,
    /// Leadership election failure that will not resolve by itself.
    Election,
    /// Temporary election failure; retry later.
    ElectionTmp,
    /// Failure on the sending side.
    Sender,
    /// Failure local to the receiving node.
    Local,
    /// Temporary failure; retry later.
    Tmp,
}

/// Application-level error envelope returned by remote methods.
///
/// An envelope may accompany a successful response value; callers must
/// inspect both. The diagnostic echo relies on this.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{err_type:?} (code {err_code:?}): {err_msg}")]
pub struct RpcError {
    pub err_code: RpcErrCode,
    pub err_msg: String,
    pub err_type: CoordErrType,
}

impl RpcError {
    pub fn new(err_code: RpcErrCode, err_msg: impl Into<String>, err_type: CoordErrType) -> Self {
        Self {
            err_code,
            err_msg: err_msg.into(),
            err_type,
        }
    }

    /// Whether this envelope denotes a failure.
    ///
    /// An envelope carrying [`RpcErrCode::NoErr`] is informational.
    pub fn is_failure(&self) -> bool {
        self.err_code != RpcErrCode::NoErr
    }
}

/// Rejection produced by the server's dispatch layer before any handler ran.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("rpc: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc: malformed request for {method}: {reason}")]
    BadRequest { method: String, reason: String },
}

/// Why an RPC call failed to produce a response.
#[derive(Debug, Error)]
pub enum RpcCallError {
    /// Connection, read or write failure.
    #[error("transport error talking to {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The call did not complete within the per-call timeout.
    #[error("rpc to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// The server rejected the method or request.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Request or response could not be encoded/decoded.
    #[error("rpc codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The remote returned a failing error envelope.
    #[error("remote error: {0}")]
    Remote(RpcError),

    /// Transport failures persisted through every retry.
    #[error("rpc {method} failed after {attempts} attempts: {source}")]
    Exhausted {
        method: String,
        attempts: usize,
        #[source]
        source: Box<RpcCallError>,
    },
}

impl RpcCallError {
    /// Transport-classified failures are the only retryable ones.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcCallError::Transport { .. } | RpcCallError::Timeout { .. }
        )
    }

    /// The peer could not be reached, even after retrying.
    pub fn is_unreachable(&self) -> bool {
        self.is_transport() || matches!(self, RpcCallError::Exhausted { .. })
    }

    /// True if the server reported the method as unknown.
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            RpcCallError::Dispatch(DispatchError::MethodNotFound(_))
        )
    }

    /// Convert into an envelope, for callers that report failures in-band.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            RpcCallError::Remote(err) => err.clone(),
            other if other.is_unreachable() => {
                RpcError::new(RpcErrCode::Common, other.to_string(), CoordErrType::Net)
            }
            other => RpcError::new(RpcErrCode::Common, other.to_string(), CoordErrType::Common),
        }
    }
}
