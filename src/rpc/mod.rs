//! Node-to-node RPC: framing, server dispatch, and the retrying client.
//!
//! Calls are addressed as `"<Service>.<Method>"`. A reply carries the encoded
//! response together with an optional [`RpcError`] envelope, so a method can
//! return data and a coordination error in the same answer.

pub mod client;
pub mod codec;
pub mod error;
pub mod server;

pub use client::{
    LeaderSessionReply, NodeRpcClient, TopicPartitionRequest, UpdateLeaderSessionRequest,
    coordinator_method, echo_envelope,
};
pub use error::{CoordErrType, DispatchError, RpcCallError, RpcErrCode, RpcError};
pub use server::{HandlerReply, RpcHandler, RpcServer};
