//! Opening handshake for the remote endpoint wire protocol: magic bytes
//! each way, then a version exchange, then the
//! `InitializeRequest`/`InitializeResponse` pair.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

use super::frame::{read_frame, write_frame};
use super::messages::{InitializeRequest, InitializeResponse, CLIENT_MAGIC, PROTOCOL_VERSION, SERVER_MAGIC};

async fn write_version<S: AsyncWrite + Unpin>(stream: &mut S, version: (u32, u32, u32)) -> Result<(), ProtocolError> {
	let mut bytes = [0u8; 12];
	bytes[0..4].copy_from_slice(&version.0.to_be_bytes());
	bytes[4..8].copy_from_slice(&version.1.to_be_bytes());
	bytes[8..12].copy_from_slice(&version.2.to_be_bytes());
	stream.write_all(&bytes).await.map_err(|_| ProtocolError::Closed)
}

async fn read_version<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u32, u32, u32), ProtocolError> {
	let mut bytes = [0u8; 12];
	stream.read_exact(&mut bytes).await.map_err(|_| ProtocolError::Closed)?;
	Ok((
		u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
		u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
		u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
	))
}

/// Dials the handshake as the connecting side and sends `request`. On
/// success, the stream is ready for `EndpointRequest`/response frames.
pub async fn client_handshake<S>(stream: &mut S, request: &InitializeRequest) -> Result<(), ProtocolError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	stream.write_all(&CLIENT_MAGIC).await.map_err(|_| ProtocolError::Closed)?;
	let mut their_magic = [0u8; 8];
	stream.read_exact(&mut their_magic).await.map_err(|_| ProtocolError::Closed)?;
	if their_magic != SERVER_MAGIC {
		return Err(ProtocolError::MagicMismatch);
	}

	write_version(stream, PROTOCOL_VERSION).await?;
	let remote_version = read_version(stream).await?;
	if remote_version != PROTOCOL_VERSION {
		return Err(ProtocolError::VersionMismatch { local: PROTOCOL_VERSION, remote: remote_version });
	}

	write_frame(stream, request).await?;
	let response: InitializeResponse =
		read_frame(stream).await?.ok_or(ProtocolError::Closed)?;
	match response.error {
		None => Ok(()),
		Some(message) => Err(ProtocolError::Decode { message }),
	}
}

/// Answers the handshake as the accepting side, returning the decoded
/// `InitializeRequest`. The caller constructs the requested endpoint and
/// sends an `InitializeResponse` with `send_initialize_response`.
pub async fn server_handshake<S>(stream: &mut S) -> Result<InitializeRequest, ProtocolError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut their_magic = [0u8; 8];
	stream.read_exact(&mut their_magic).await.map_err(|_| ProtocolError::Closed)?;
	if their_magic != CLIENT_MAGIC {
		return Err(ProtocolError::MagicMismatch);
	}
	stream.write_all(&SERVER_MAGIC).await.map_err(|_| ProtocolError::Closed)?;

	let remote_version = read_version(stream).await?;
	write_version(stream, PROTOCOL_VERSION).await?;
	if remote_version != PROTOCOL_VERSION {
		return Err(ProtocolError::VersionMismatch { local: PROTOCOL_VERSION, remote: remote_version });
	}

	read_frame(stream).await?.ok_or(ProtocolError::Closed)
}

pub async fn send_initialize_response<S>(stream: &mut S, error: Option<String>) -> Result<(), ProtocolError>
where
	S: AsyncWrite + Unpin,
{
	write_frame(stream, &InitializeResponse { error }).await
}


// vim: ts=4
