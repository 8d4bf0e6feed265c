//! RPC server: accepts framed requests and dispatches `"<Service>.<Method>"`
//! calls to an [`RpcHandler`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::codec::{RpcReply, RpcRequest, encode_body, read_frame, write_frame};
use super::error::{DispatchError, RpcError};
use crate::cluster::metrics::RPC_SERVED;
use crate::constants::ACCEPT_ERROR_BACKOFF;

/// A handler's answer: encoded response value plus optional error envelope.
#[derive(Debug, Clone)]
pub struct HandlerReply {
    pub body: Vec<u8>,
    pub coord_err: Option<RpcError>,
}

impl HandlerReply {
    /// Encode `value` as the response body.
    pub fn new<T: Serialize>(value: &T, coord_err: Option<RpcError>) -> Result<Self, bincode::Error> {
        Ok(Self {
            body: encode_body(value)?,
            coord_err,
        })
    }
}

/// Service that answers the methods of one RPC service name.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Service part of `"<Service>.<Method>"`.
    fn service_name(&self) -> &str;

    /// Handle `method` (without the service prefix) with an encoded argument.
    ///
    /// Unknown methods return [`DispatchError::MethodNotFound`].
    async fn handle(&self, method: &str, body: &[u8]) -> Result<HandlerReply, DispatchError>;
}

/// TCP server for node-to-node RPC.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    /// Bind the listener. Bind failures are returned immediately.
    pub async fn bind(addr: &str, handler: Arc<dyn RpcHandler>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, service = handler.service_name(), "RPC server listening");
        Ok(Self {
            listener,
            local_addr,
            handler,
        })
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires or its sender is dropped.
    ///
    /// Each connection runs on its own task and also stops on shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(addr = %self.local_addr, "RPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            backoff_after_accept_error(&e).await;
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let conn_shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(handler, stream, conn_shutdown).await {
                            debug!(peer = %peer_addr, error = %e, "RPC connection closed with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        handler: Arc<dyn RpcHandler>,
        mut stream: TcpStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        stream.set_nodelay(true)?;

        loop {
            let request = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                frame = read_frame::<_, RpcRequest>(&mut stream) => match frame? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            let reply = dispatch(handler.as_ref(), &request).await;
            write_frame(&mut stream, &reply).await?;
        }
    }
}

/// Out of file descriptors and the like; pause instead of spinning.
async fn backoff_after_accept_error(error: &std::io::Error) {
    warn!(error = %error, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "Failed to accept RPC connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Route a request to the handler, rejecting foreign services and unknown methods.
pub async fn dispatch(handler: &dyn RpcHandler, request: &RpcRequest) -> RpcReply {
    let outcome = match request.method.split_once('.') {
        Some((service, method)) if service == handler.service_name() => {
            handler.handle(method, &request.body).await
        }
        _ => Err(DispatchError::MethodNotFound(request.method.clone())),
    };

    match outcome {
        Ok(reply) => {
            let label = if reply.coord_err.is_some() { "envelope" } else { "ok" };
            RPC_SERVED
                .with_label_values(&[request.method.as_str(), label])
                .inc();
            RpcReply::Ok {
                body: reply.body,
                coord_err: reply.coord_err,
            }
        }
        Err(e) => {
            debug!(method = %request.method, error = %e, "Rejected RPC request");
            RPC_SERVED
                .with_label_values(&[request.method.as_str(), "rejected"])
                .inc();
            RpcReply::Dispatch(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::decode_body;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        fn service_name(&self) -> &str {
            "Echo"
        }

        async fn handle(&self, method: &str, body: &[u8]) -> Result<HandlerReply, DispatchError> {
            match method {
                "Say" => {
                    let text: String =
                        decode_body(body).map_err(|e| DispatchError::BadRequest {
                            method: method.to_string(),
                            reason: e.to_string(),
                        })?;
                    HandlerReply::new(&text, None).map_err(|e| DispatchError::BadRequest {
                        method: method.to_string(),
                        reason: e.to_string(),
                    })
                }
                other => Err(DispatchError::MethodNotFound(format!("Echo.{}", other))),
            }
        }
    }

    fn request(method: &str, body: Vec<u8>) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            body,
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_known_method() {
        let reply = dispatch(&Echo, &request("Echo.Say", encode_body(&"hi").unwrap())).await;
        match reply {
            RpcReply::Ok { body, coord_err } => {
                assert_eq!(decode_body::<String>(&body).unwrap(), "hi");
                assert!(coord_err.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unknown_method_and_service() {
        for method in ["Echo.Shout", "Other.Say", "NoDotAtAll"] {
            let reply = dispatch(&Echo, &request(method, vec![])).await;
            assert!(
                matches!(reply, RpcReply::Dispatch(DispatchError::MethodNotFound(_))),
                "{} should be rejected",
                method
            );
        }
    }

    #[tokio::test]
    async fn test_dispatch_reports_malformed_body() {
        let reply = dispatch(&Echo, &request("Echo.Say", vec![0xff])).await;
        assert!(matches!(
            reply,
            RpcReply::Dispatch(DispatchError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let addr = server.local_addr().to_string();
        assert!(RpcServer::bind(&addr, Arc::new(Echo)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pauses_before_retrying() {
        let start = tokio::time::Instant::now();
        backoff_after_accept_error(&std::io::Error::from(std::io::ErrorKind::Other)).await;
        assert!(start.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }
}
