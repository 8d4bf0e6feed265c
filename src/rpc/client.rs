//! Resilient RPC client for node-to-node calls.
//!
//! - The connection is opened eagerly in [`NodeRpcClient::connect`]; a peer
//!   that cannot be reached fails construction.
//! - Each attempt reuses the cached connection and reconnects if it broke.
//! - Transport failures (refused, reset, EOF, timeout) are retried with the
//!   [`rpc_policy`](crate::cluster::retry::rpc_policy); dispatch and codec
//!   failures are returned after the first attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use backon::Retryable;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::codec::{RpcReply, RpcRequest, decode_body, encode_body, read_frame, write_frame};
use super::error::{CoordErrType, RpcCallError, RpcErrCode, RpcError};
use crate::cluster::metrics::record_rpc_call;
use crate::cluster::retry::{
    record_retry_attempt, record_retry_exhausted, record_retry_success, rpc_policy,
};
use crate::constants::{
    COORDINATOR_SERVICE, DEFAULT_RPC_MAX_RETRIES, DEFAULT_RPC_RETRY_DELAY,
    METHOD_GET_TOPIC_INFO, METHOD_GET_TOPIC_LEADER_SESSION, METHOD_TEST_RPC_CALL,
    METHOD_UPDATE_TOPIC_LEADER_SESSION,
};
use crate::types::{Epoch, TopicLeaderSession, TopicPartitionMetaInfo};

/// Leader session propagated from a partition leader to its ISR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct UpdateLeaderSessionRequest {
    pub topic_info: TopicPartitionMetaInfo,
    pub leader_session: TopicLeaderSession,
}

impl UpdateLeaderSessionRequest {
    pub fn leader_epoch(&self) -> Epoch {
        self.leader_session.leader_epoch
    }
}

/// Identifies a partition in query RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct TopicPartitionRequest {
    pub topic: String,
    pub partition: i32,
}

/// Answer to a leader session query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct LeaderSessionReply {
    pub leader_session: TopicLeaderSession,
    /// Leader holds the session and has its local data loaded.
    pub servable: bool,
}

/// Build `"<Service>.<Method>"` for the coordinator service.
pub fn coordinator_method(method: &str) -> String {
    format!("{}.{}", COORDINATOR_SERVICE, method)
}

/// RPC client bound to one peer.
pub struct NodeRpcClient {
    addr: String,
    call_timeout: Duration,
    max_retries: usize,
    retry_delay: Duration,
    /// Cached TCP connection for reuse.
    conn: Mutex<Option<TcpStream>>,
}

impl std::fmt::Debug for NodeRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRpcClient")
            .field("addr", &self.addr)
            .field("call_timeout", &self.call_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl NodeRpcClient {
    /// Connect to `addr`, bounding the connection and every call by `call_timeout`.
    pub async fn connect(addr: &str, call_timeout: Duration) -> Result<Self, RpcCallError> {
        let stream = open_connection(addr, call_timeout).await?;
        debug!(addr, "RPC client connected");
        Ok(Self {
            addr: addr.to_string(),
            call_timeout,
            max_retries: DEFAULT_RPC_MAX_RETRIES,
            retry_delay: DEFAULT_RPC_RETRY_DELAY,
            conn: Mutex::new(Some(stream)),
        })
    }

    /// Override the retry bounds for transport failures.
    pub fn with_retry_policy(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Invoke `method`, retrying transport failures, and return the response
    /// together with any error envelope the remote attached.
    pub async fn call_enveloped<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<(Resp, Option<RpcError>), RpcCallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let frame = RpcRequest {
            method: method.to_string(),
            body: encode_body(request)?,
        };
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();

        let result = (|| {
            let frame = &frame;
            let attempts = &attempts;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt > 0 {
                    record_retry_attempt("rpc", attempt);
                }
                self.attempt(frame).await
            }
        })
        .retry(rpc_policy(self.retry_delay, self.max_retries))
        .when(RpcCallError::is_transport)
        .notify(|err, delay| {
            debug!(addr = %self.addr, method, error = %err, delay_ms = delay.as_millis() as u64, "Retrying RPC after backoff");
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(reply) => {
                if attempts > 1 {
                    record_retry_success("rpc");
                }
                record_rpc_call(method, "ok", elapsed);
                let (body, coord_err) = reply;
                Ok((decode_body(&body)?, coord_err))
            }
            Err(e) if e.is_transport() => {
                record_retry_exhausted("rpc");
                record_rpc_call(method, "exhausted", elapsed);
                warn!(addr = %self.addr, method, attempts, error = %e, "RPC retries exhausted");
                Err(RpcCallError::Exhausted {
                    method: method.to_string(),
                    attempts,
                    source: Box::new(e),
                })
            }
            Err(e) => {
                record_rpc_call(method, "rejected", elapsed);
                Err(e)
            }
        }
    }

    /// Invoke `method`, retrying transport failures.
    ///
    /// A failing error envelope from the remote becomes [`RpcCallError::Remote`];
    /// an envelope with [`RpcErrCode::NoErr`] is ignored.
    pub async fn call_with_retry<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcCallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let (response, coord_err) = self.call_enveloped(method, request).await?;
        match coord_err {
            Some(err) if err.is_failure() => Err(RpcCallError::Remote(err)),
            _ => Ok(response),
        }
    }

    /// Diagnostic echo.
    ///
    /// The remote returns `payload` as the response *and* an error envelope
    /// whose message is `payload` with type [`CoordErrType::Common`]. A call
    /// that never reached the remote yields an empty response and a
    /// [`CoordErrType::Net`] envelope.
    pub async fn call_rpc_test(&self, payload: &str) -> (String, Option<RpcError>) {
        match self
            .call_enveloped::<str, String>(&coordinator_method(METHOD_TEST_RPC_CALL), payload)
            .await
        {
            Ok((response, coord_err)) => (response, coord_err),
            Err(e) => (String::new(), Some(e.to_rpc_error())),
        }
    }

    /// Push a new leader session to this peer.
    pub async fn update_topic_leader_session(
        &self,
        request: &UpdateLeaderSessionRequest,
    ) -> Result<(), RpcCallError> {
        self.call_with_retry(&coordinator_method(METHOD_UPDATE_TOPIC_LEADER_SESSION), request)
            .await
    }

    /// Ask this peer for its view of a partition's leader session.
    pub async fn get_topic_leader_session(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<LeaderSessionReply, RpcCallError> {
        let request = TopicPartitionRequest {
            topic: topic.to_string(),
            partition,
        };
        self.call_with_retry(&coordinator_method(METHOD_GET_TOPIC_LEADER_SESSION), &request)
            .await
    }

    /// Ask this peer for its view of a partition's replication info.
    pub async fn get_topic_info(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<TopicPartitionMetaInfo, RpcCallError> {
        let request = TopicPartitionRequest {
            topic: topic.to_string(),
            partition,
        };
        self.call_with_retry(&coordinator_method(METHOD_GET_TOPIC_INFO), &request)
            .await
    }

    /// One attempt bounded by the call timeout.
    async fn attempt(
        &self,
        frame: &RpcRequest,
    ) -> Result<(Vec<u8>, Option<RpcError>), RpcCallError> {
        match timeout(self.call_timeout, self.exchange(frame)).await {
            Ok(result) => result,
            Err(_) => {
                // The stream may hold a half-read reply; never reuse it.
                *self.conn.lock().await = None;
                Err(RpcCallError::Timeout {
                    addr: self.addr.clone(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn exchange(
        &self,
        frame: &RpcRequest,
    ) -> Result<(Vec<u8>, Option<RpcError>), RpcCallError> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(open_connection(&self.addr, self.call_timeout).await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(self.transport_error(std::io::ErrorKind::NotConnected.into()));
        };

        let result = async {
            write_frame(stream, frame).await?;
            read_frame::<_, RpcReply>(stream).await?.ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before reply",
                )
            })
        }
        .await;

        match result {
            Ok(RpcReply::Ok { body, coord_err }) => Ok((body, coord_err)),
            Ok(RpcReply::Dispatch(e)) => Err(RpcCallError::Dispatch(e)),
            Err(e) => {
                // Connection is broken, reconnect on the next attempt.
                *guard = None;
                Err(self.transport_error(e))
            }
        }
    }

    fn transport_error(&self, source: std::io::Error) -> RpcCallError {
        RpcCallError::Transport {
            addr: self.addr.clone(),
            source,
        }
    }
}

async fn open_connection(addr: &str, connect_timeout: Duration) -> Result<TcpStream, RpcCallError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcCallError::Timeout {
            addr: addr.to_string(),
            timeout_ms: connect_timeout.as_millis() as u64,
        })?
        .map_err(|source| RpcCallError::Transport {
            addr: addr.to_string(),
            source,
        })?;
    stream
        .set_nodelay(true)
        .map_err(|source| RpcCallError::Transport {
            addr: addr.to_string(),
            source,
        })?;
    Ok(stream)
}

/// Envelope the diagnostic echo returns alongside its response.
pub fn echo_envelope(payload: &str) -> RpcError {
    RpcError::new(RpcErrCode::NoErr, payload, CoordErrType::Common)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_method_name() {
        assert_eq!(
            coordinator_method("TestRpcCall"),
            "NodeCoordinator.TestRpcCall"
        );
    }

    #[test]
    fn test_echo_envelope_shape() {
        let env = echo_envelope("reqdata");
        assert_eq!(env.err_code, RpcErrCode::NoErr);
        assert_eq!(env.err_msg, "reqdata");
        assert_eq!(env.err_type, CoordErrType::Common);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_at_construction() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = NodeRpcClient::connect(&addr, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
