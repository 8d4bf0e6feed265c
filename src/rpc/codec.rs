//! Wire framing for node-to-node RPC.
//!
//! Every message is a 4-byte big-endian length prefix followed by a bincode
//! payload. A connection carries any number of request/reply pairs in order.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{DispatchError, RpcError};
use crate::constants::MAX_RPC_FRAME_SIZE;

/// A request frame: `"<Service>.<Method>"` plus the encoded argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub body: Vec<u8>,
}

/// A reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    /// The method ran. `coord_err` travels alongside the body, never instead of it.
    Ok {
        body: Vec<u8>,
        coord_err: Option<RpcError>,
    },
    /// The dispatch layer rejected the call.
    Dispatch(DispatchError),
}

/// Encode a typed value into a frame body.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Decode a frame body into a typed value.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(body)
}

/// Serialize `message` and write it as one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_RPC_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", data.len()),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await
}

/// Read one length-prefixed frame and deserialize it.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RPC_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let message = bincode::deserialize(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}
