//! Per-file streaming transmission: for each path, zero or
//! more operation frames followed by exactly one `done` frame. A per-file
//! error rides in `done` and is non-terminal; only a transport failure
//! (a `FrameSink`/`FrameSource` error) stops the whole stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt};

use crate::error::RsyncError;

use super::delta::{deltify, OperationSink};
use super::operation::Operation;
use super::patch::apply_operation;
use super::signature::Signature;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage {
	Operation { operation: Operation, expected_size: u64 },
	Done { error: Option<String> },
}

#[async_trait]
pub trait FrameSink {
	async fn send(&mut self, frame: StreamMessage) -> Result<(), RsyncError>;
}

#[async_trait]
pub trait FrameSource {
	async fn recv(&mut self) -> Result<Option<StreamMessage>, RsyncError>;
}

/// Adapts a `FrameSink` into an `OperationSink`, stamping `expected_size`
/// (0 meaning unknown) onto only the first operation of the file.
struct FramedOperationSink<'a, F: FrameSink + ?Sized> {
	sink: &'a mut F,
	expected_size: u64,
}

#[async_trait]
impl<'a, F: FrameSink + Send + ?Sized> OperationSink for FramedOperationSink<'a, F> {
	async fn send(&mut self, op: Operation) -> Result<(), RsyncError> {
		let expected_size = std::mem::replace(&mut self.expected_size, 0);
		self.sink.send(StreamMessage::Operation { operation: op, expected_size }).await
	}
}

/// Deltifies `target` against `base_signature` and streams the result as
/// operation frames, terminated by a `done` frame. A failure while
/// deltifying is reported through `done`'s error field rather than
/// returned, matching the non-terminal failure policy for per-file errors.
pub async fn transmit_file<R, F>(
	target: R,
	base_signature: &Signature,
	max_data_op_size: usize,
	expected_size: u64,
	sink: &mut F,
) -> Result<(), RsyncError>
where
	R: AsyncRead + Unpin,
	F: FrameSink + Send + ?Sized,
{
	let mut framed = FramedOperationSink { sink, expected_size };
	let outcome = deltify(target, base_signature, max_data_op_size, &mut framed).await;
	let error = outcome.err().map(|e| e.to_string());
	sink.send(StreamMessage::Done { error }).await
}

/// Consumes frames for one file, applying each operation as it arrives,
/// until the `done` frame. Returns the sender-reported per-file error (if
/// any); an `Err` return means the frame source itself failed.
pub async fn receive_file<S, D, B>(
	source: &mut S,
	mut destination: D,
	mut base: B,
	signature: &Signature,
) -> Result<Option<String>, RsyncError>
where
	S: FrameSource + Send,
	D: AsyncWrite + Unpin,
	B: AsyncRead + AsyncSeek + Unpin,
{
	let mut scratch = vec![0u8; signature.block_size as usize];
	loop {
		match source.recv().await? {
			None => return Err(RsyncError::MalformedOperation { message: "stream ended before done frame".to_string() }),
			Some(StreamMessage::Done { error }) => {
				destination.flush().await.map_err(RsyncError::Io)?;
				return Ok(error);
			}
			Some(StreamMessage::Operation { operation, .. }) => {
				if let Err(e) = apply_operation(&mut destination, &mut base, signature, &operation, &mut scratch).await {
					// A local application failure is this file's problem,
					// not the stream's; drain the remaining frames for this
					// file so the next file starts aligned.
					let local_error = e.to_string();
					loop {
						match source.recv().await? {
							None => {
								return Err(RsyncError::MalformedOperation {
									message: "stream ended before done frame".to_string(),
								});
							}
							Some(StreamMessage::Done { .. }) => return Ok(Some(local_error)),
							Some(StreamMessage::Operation { .. }) => {}
						}
					}
				}
			}
		}
	}
}


// vim: ts=4
