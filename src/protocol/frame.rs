//! Length-delimited framing for the remote endpoint wire protocol: each
//! record is a big-endian `u32` byte length followed by a
//! `bincode`-encoded payload of exactly that many bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Frames larger than this are rejected without allocating, since a
/// corrupted or hostile length prefix should not be able to trigger an
/// unbounded allocation.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let payload = bincode::serialize(value)
		.map_err(|e| ProtocolError::Decode { message: format!("failed to encode frame: {}", e) })?;
	let len = u32::try_from(payload.len())
		.map_err(|_| ProtocolError::Framing { message: "frame exceeds u32 length".to_string() })?;
	writer.write_all(&len.to_be_bytes()).await.map_err(|_| ProtocolError::Closed)?;
	writer.write_all(&payload).await.map_err(|_| ProtocolError::Closed)?;
	writer.flush().await.map_err(|_| ProtocolError::Closed)
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames (not mid-frame, which is a `Closed` error).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	let mut len_bytes = [0u8; 4];
	match reader.read_exact(&mut len_bytes).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(_) => return Err(ProtocolError::Closed),
	}
	let len = u32::from_be_bytes(len_bytes);
	if len > MAX_FRAME_BYTES {
		return Err(ProtocolError::Framing { message: format!("frame of {} bytes exceeds the {} byte cap", len, MAX_FRAME_BYTES) });
	}
	let mut payload = vec![0u8; len as usize];
	reader.read_exact(&mut payload).await.map_err(|_| ProtocolError::Closed)?;
	bincode::deserialize(&payload)
		.map(Some)
		.map_err(|e| ProtocolError::Decode { message: format!("failed to decode frame: {}", e) })
}


// vim: ts=4
