//! The remote endpoint codec: `RemoteEndpoint` lets a
//! controller drive an endpoint on the far side of a byte stream exactly
//! like a local one, and `serve_endpoint` answers it in front of a
//! `LocalEndpoint`. Snapshots never cross the wire whole; each side keeps a
//! rolling serialized baseline and only the rsync delta is transmitted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, LocalEndpoint, ScanResult, StageOutcome};
use crate::entry::Snapshot;
use crate::error::{ProtocolError, RsyncError, SyncError};
use crate::hash::HashAlgorithm;
use crate::reconciler::Change;
use crate::rsync::{deltify, patch, signature, FrameSink, Operation, Signature, StreamMessage};
use crate::session::DataDirectory;
use crate::transitioner::TransitionOutcome;

use super::frame::{read_frame, write_frame};
use super::messages::{
	EndpointRequest, InitializeRequest, PollResponse, ScanResponse, StageResponse, TransitionResponse,
};
use super::negotiation::{client_handshake, send_initialize_response, server_handshake};

/// How often a blocked poll checks its cancellation callback.
const POLL_CANCEL_INTERVAL: Duration = Duration::from_millis(100);

/// Data ops in a serialized-snapshot delta are capped well below the frame
/// cap; snapshots compress to runs of shared structure anyway.
const SNAPSHOT_MAX_DATA_OP_SIZE: usize = 64 * 1024;

/// Serialize a snapshot and deltify it against `baseline`, using the block
/// size both sides derive deterministically from the baseline length.
async fn snapshot_delta(
	current: &[u8],
	baseline: &[u8],
	hash_algorithm: HashAlgorithm,
) -> Result<Vec<Operation>, RsyncError> {
	let base_signature = signature(baseline, baseline.len() as u64, 0, hash_algorithm).await?;
	let mut operations: Vec<Operation> = Vec::new();
	deltify(current, &base_signature, SNAPSHOT_MAX_DATA_OP_SIZE, &mut operations).await?;
	Ok(operations)
}

/// Reassemble a serialized snapshot from a delta against `baseline`.
async fn snapshot_from_delta(
	operations: &[Operation],
	baseline: &[u8],
	hash_algorithm: HashAlgorithm,
) -> Result<Vec<u8>, RsyncError> {
	let base_signature = signature(baseline, baseline.len() as u64, 0, hash_algorithm).await?;
	let mut reassembled = Vec::new();
	patch(&mut reassembled, std::io::Cursor::new(baseline), &base_signature, operations).await?;
	Ok(reassembled)
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, ProtocolError> {
	bincode::serialize(snapshot).map_err(|e| ProtocolError::Decode { message: format!("failed to encode snapshot: {}", e) })
}

/// Streams rsync frames onto the shared write half; handed out by `stage`
/// as the receiver the controller feeds from the provider's `supply`.
struct WireFrameSink<S> {
	writer: Arc<Mutex<WriteHalf<S>>>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> FrameSink for WireFrameSink<S> {
	async fn send(&mut self, frame: StreamMessage) -> Result<(), RsyncError> {
		let mut writer = self.writer.lock().await;
		write_frame(&mut *writer, &frame)
			.await
			.map_err(|e| RsyncError::Io(std::io::Error::other(e.to_string())))
	}
}

/// The controller-side codec. One instance owns one side of one session's
/// connection; calls are serial, matching the endpoint contract.
pub struct RemoteEndpoint<S> {
	reader: ReadHalf<S>,
	writer: Arc<Mutex<WriteHalf<S>>>,
	hash_algorithm: HashAlgorithm,
	/// The serialized form of the last snapshot this side successfully
	/// received, mirrored by the server; the delta baseline.
	last_snapshot_bytes: Option<Vec<u8>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> RemoteEndpoint<S> {
	/// Performs the magic/version/initialize handshake and wraps the stream.
	pub async fn connect(mut stream: S, request: InitializeRequest) -> Result<Self, SyncError> {
		let hash_algorithm = request.configuration.hash_algorithm;
		client_handshake(&mut stream, &request).await?;
		let (reader, writer) = tokio::io::split(stream);
		Ok(RemoteEndpoint {
			reader,
			writer: Arc::new(Mutex::new(writer)),
			hash_algorithm,
			last_snapshot_bytes: None,
		})
	}

	async fn send_request(&mut self, request: &EndpointRequest) -> Result<(), SyncError> {
		let mut writer = self.writer.lock().await;
		write_frame(&mut *writer, request).await.map_err(SyncError::Protocol)
	}

	async fn read_response<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, SyncError> {
		read_frame(&mut self.reader)
			.await
			.map_err(SyncError::Protocol)?
			.ok_or(SyncError::Protocol(ProtocolError::Closed))
	}

	/// One scan round trip; the delta reconstruction happens in `scan`,
	/// which owns the fallback logic.
	async fn scan_round_trip(
		&mut self,
		ancestor: &Snapshot,
		full: bool,
		force_full_snapshot: bool,
	) -> Result<ScanResponse, SyncError> {
		self.send_request(&EndpointRequest::Scan { ancestor: ancestor.clone(), full, force_full_snapshot }).await?;
		self.read_response().await
	}
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Endpoint for RemoteEndpoint<S> {
	async fn poll(&mut self, cancelled: &mut (dyn FnMut() -> bool + Send)) -> Result<(), SyncError> {
		self.send_request(&EndpointRequest::Poll).await?;

		// The response and our completion may cross in either order; we
		// always send exactly one completion and read exactly one response.
		let mut completion_sent = false;
		let read_fut = read_frame::<_, PollResponse>(&mut self.reader);
		tokio::pin!(read_fut);
		let response = loop {
			tokio::select! {
				response = &mut read_fut => break response,
				_ = tokio::time::sleep(POLL_CANCEL_INTERVAL) => {
					if cancelled() && !completion_sent {
						let mut writer = self.writer.lock().await;
						write_frame(&mut *writer, &EndpointRequest::PollCompletion).await.map_err(SyncError::Protocol)?;
						completion_sent = true;
					}
				}
			}
		};
		let response = response.map_err(SyncError::Protocol)?.ok_or(SyncError::Protocol(ProtocolError::Closed))?;

		if !completion_sent {
			let mut writer = self.writer.lock().await;
			write_frame(&mut *writer, &EndpointRequest::PollCompletion).await.map_err(SyncError::Protocol)?;
		}

		match response.error {
			None => Ok(()),
			Some(message) => Err(SyncError::Protocol(ProtocolError::Decode { message })),
		}
	}

	async fn scan(&mut self, ancestor: &Snapshot, full: bool) -> Result<ScanResult, SyncError> {
		let response = self.scan_round_trip(ancestor, full, false).await?;
		if let Some(message) = response.error {
			return Err(SyncError::Protocol(ProtocolError::Decode { message }));
		}
		if response.try_again {
			return Ok(ScanResult::Retry);
		}

		// Reconstruct against our rolling baseline (the ancestor on the
		// first scan), falling back to a full retransmission if the delta
		// fails to apply or decode.
		let baseline = match &self.last_snapshot_bytes {
			Some(bytes) => bytes.clone(),
			None => encode_snapshot(ancestor)?,
		};
		let reconstructed = match snapshot_from_delta(&response.snapshot_delta, &baseline, self.hash_algorithm).await {
			Ok(bytes) => match bincode::deserialize::<Snapshot>(&bytes) {
				Ok(snapshot) => Some((bytes, snapshot)),
				Err(_) => None,
			},
			Err(_) => None,
		};
		let mut preserves_executability = response.preserves_executability;

		let (bytes, snapshot) = match reconstructed {
			Some(result) => result,
			None => {
				debug!("snapshot delta application failed, requesting raw snapshot");
				let response = self.scan_round_trip(ancestor, full, true).await?;
				if let Some(message) = response.error {
					return Err(SyncError::Protocol(ProtocolError::Decode { message }));
				}
				if response.try_again {
					return Ok(ScanResult::Retry);
				}
				preserves_executability = response.preserves_executability;
				let bytes = snapshot_from_delta(&response.snapshot_delta, &[], self.hash_algorithm)
					.await
					.map_err(SyncError::Rsync)?;
				let snapshot = bincode::deserialize::<Snapshot>(&bytes)
					.map_err(|e| SyncError::Protocol(ProtocolError::Decode { message: format!("failed to decode snapshot: {}", e) }))?;
				(bytes, snapshot)
			}
		};

		self.last_snapshot_bytes = Some(bytes);
		Ok(ScanResult::Ready { snapshot, preserves_executability })
	}

	async fn stage(&mut self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome, SyncError> {
		self.send_request(&EndpointRequest::Stage { paths: paths.to_vec(), digests: digests.to_vec() }).await?;
		let response: StageResponse = self.read_response().await?;
		if let Some(message) = response.error {
			return Err(SyncError::Protocol(ProtocolError::Decode { message }));
		}
		Ok(StageOutcome {
			filtered_paths: response.paths,
			signatures: response.signatures,
			receiver: Box::new(WireFrameSink { writer: self.writer.clone() }),
		})
	}

	async fn supply(&mut self, paths: &[String], signatures: &[Signature], sink: &mut (dyn FrameSink + Send)) -> Result<(), SyncError> {
		self.send_request(&EndpointRequest::Supply { paths: paths.to_vec(), signatures: signatures.to_vec() }).await?;

		// No reply frame; the server starts streaming immediately. Forward
		// frames until one done per requested path has passed through.
		let mut remaining = paths.len();
		while remaining > 0 {
			let frame: StreamMessage = read_frame(&mut self.reader)
				.await
				.map_err(SyncError::Protocol)?
				.ok_or(SyncError::Protocol(ProtocolError::Closed))?;
			let is_done = matches!(frame, StreamMessage::Done { .. });
			sink.send(frame).await.map_err(SyncError::Rsync)?;
			if is_done {
				remaining -= 1;
			}
		}
		Ok(())
	}

	async fn transition(&mut self, changes: &[Change]) -> Result<TransitionOutcome, SyncError> {
		self.send_request(&EndpointRequest::Transition { changes: changes.to_vec() }).await?;
		let response: TransitionResponse = self.read_response().await?;
		if let Some(message) = response.error {
			return Err(SyncError::Protocol(ProtocolError::Decode { message }));
		}
		Ok(TransitionOutcome {
			results: response.results,
			problems: response.problems,
			stager_missing_files: response.stager_missing_files,
			made_changes: response.made_changes,
		})
	}

	async fn shutdown(&mut self) {
		let mut writer = self.writer.lock().await;
		let _ = writer.shutdown().await;
	}
}

/// Answers one connection's handshake, builds the requested local endpoint
/// under `data`, and serves requests until the peer closes the stream.
pub async fn serve_endpoint<S>(mut stream: S, data: &DataDirectory) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let request = server_handshake(&mut stream).await.map_err(SyncError::Protocol)?;

	let read_only = request.alpha && request.configuration.synchronization_mode.alpha_is_read_only();
	let root = PathBuf::from(&request.root);
	let staging_root = data.resolve_staging_root(request.configuration.staging_mode, &request.session, request.alpha, &root);
	let endpoint = LocalEndpoint::new(
		root,
		data.cache_path(&request.session, request.alpha),
		staging_root,
		request.configuration.clone(),
		read_only,
	);
	let mut endpoint = match endpoint {
		Ok(endpoint) => {
			send_initialize_response(&mut stream, None).await.map_err(SyncError::Protocol)?;
			endpoint
		}
		Err(e) => {
			send_initialize_response(&mut stream, Some(e.to_string())).await.map_err(SyncError::Protocol)?;
			return Err(e);
		}
	};

	let hash_algorithm = request.configuration.hash_algorithm;
	let (mut reader, mut writer) = tokio::io::split(stream);
	let mut last_snapshot_bytes: Option<Vec<u8>> = None;

	let result = serve_requests(&mut reader, &mut writer, &mut endpoint, hash_algorithm, &mut last_snapshot_bytes).await;
	endpoint.shutdown().await;
	result
}

async fn serve_requests<S>(
	reader: &mut ReadHalf<S>,
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
	hash_algorithm: HashAlgorithm,
	last_snapshot_bytes: &mut Option<Vec<u8>>,
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	loop {
		let request: Option<EndpointRequest> = read_frame(reader).await.map_err(SyncError::Protocol)?;
		let request = match request {
			Some(request) => request,
			// Clean close between requests is the shutdown signal.
			None => return Ok(()),
		};

		match request {
			EndpointRequest::Poll => serve_poll(reader, writer, endpoint).await?,
			EndpointRequest::PollCompletion => {
				return Err(SyncError::Protocol(ProtocolError::Decode {
					message: "poll completion outside an active poll".to_string(),
				}));
			}
			EndpointRequest::Scan { ancestor, full, force_full_snapshot } => {
				serve_scan(writer, endpoint, hash_algorithm, last_snapshot_bytes, &ancestor, full, force_full_snapshot).await?;
			}
			EndpointRequest::Stage { paths, digests } => serve_stage(reader, writer, endpoint, &paths, &digests).await?,
			EndpointRequest::Supply { paths, signatures } => serve_supply(writer, endpoint, &paths, &signatures).await?,
			EndpointRequest::Transition { changes } => serve_transition(writer, endpoint, &changes).await?,
		}
	}
}

/// Serve one poll: run the endpoint's poll until it observes a change or
/// the client's completion arrives, then send exactly one response and
/// consume exactly one completion.
async fn serve_poll<S>(
	reader: &mut ReadHalf<S>,
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let completed = Arc::new(AtomicBool::new(false));
	let completed_for_poll = completed.clone();
	let mut cancelled = move || completed_for_poll.load(Ordering::Acquire);

	let poll_fut = endpoint.poll(&mut cancelled);
	tokio::pin!(poll_fut);

	// Pinned once so a branch switch never drops it mid-read; the response
	// and the client's completion may cross in either order.
	let read_fut = read_frame::<_, EndpointRequest>(reader);
	tokio::pin!(read_fut);

	let mut response_sent = false;
	let mut completion_received = false;

	while !(response_sent && completion_received) {
		tokio::select! {
			result = &mut poll_fut, if !response_sent => {
				let error = result.err().map(|e| e.to_string());
				write_frame(writer, &PollResponse { error }).await.map_err(SyncError::Protocol)?;
				response_sent = true;
			}
			frame = &mut read_fut, if !completion_received => {
				match frame.map_err(SyncError::Protocol)? {
					Some(EndpointRequest::PollCompletion) => {
						completion_received = true;
						completed.store(true, Ordering::Release);
					}
					Some(_) => {
						return Err(SyncError::Protocol(ProtocolError::Decode {
							message: "unexpected request during poll".to_string(),
						}));
					}
					None => return Err(SyncError::Protocol(ProtocolError::Closed)),
				}
			}
		}
	}
	Ok(())
}

async fn serve_scan<S>(
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
	hash_algorithm: HashAlgorithm,
	last_snapshot_bytes: &mut Option<Vec<u8>>,
	ancestor: &Snapshot,
	full: bool,
	force_full_snapshot: bool,
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let response = match endpoint.scan(ancestor, full).await {
		Ok(ScanResult::Retry) => ScanResponse {
			snapshot_delta: Vec::new(),
			preserves_executability: true,
			try_again: true,
			error: None,
		},
		Ok(ScanResult::Ready { snapshot, preserves_executability }) => {
			let current = encode_snapshot(&snapshot).map_err(SyncError::Protocol)?;
			let baseline = if force_full_snapshot {
				Vec::new()
			} else {
				match last_snapshot_bytes {
					Some(bytes) => bytes.clone(),
					None => encode_snapshot(ancestor).map_err(SyncError::Protocol)?,
				}
			};
			let delta = snapshot_delta(&current, &baseline, hash_algorithm).await.map_err(SyncError::Rsync)?;
			*last_snapshot_bytes = Some(current);
			ScanResponse {
				snapshot_delta: delta,
				preserves_executability,
				try_again: false,
				error: None,
			}
		}
		Err(e) => ScanResponse {
			snapshot_delta: Vec::new(),
			preserves_executability: true,
			try_again: false,
			error: Some(e.to_string()),
		},
	};
	write_frame(writer, &response).await.map_err(SyncError::Protocol)
}

/// Serve one stage: reply with the filtered paths and signatures, then pump
/// the client's rsync stream into the local receiver, one done frame per
/// filtered path.
async fn serve_stage<S>(
	reader: &mut ReadHalf<S>,
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
	paths: &[String],
	digests: &[Vec<u8>],
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let outcome = match endpoint.stage(paths, digests).await {
		Ok(outcome) => outcome,
		Err(e) => {
			let response = StageResponse { paths: Vec::new(), signatures: Vec::new(), error: Some(e.to_string()) };
			return write_frame(writer, &response).await.map_err(SyncError::Protocol);
		}
	};

	let response = StageResponse {
		paths: outcome.filtered_paths.clone(),
		signatures: outcome.signatures.clone(),
		error: None,
	};
	write_frame(writer, &response).await.map_err(SyncError::Protocol)?;

	let mut receiver = outcome.receiver;
	let mut remaining = outcome.filtered_paths.len();
	while remaining > 0 {
		let frame: StreamMessage = read_frame(reader)
			.await
			.map_err(SyncError::Protocol)?
			.ok_or(SyncError::Protocol(ProtocolError::Closed))?;
		let is_done = matches!(frame, StreamMessage::Done { .. });
		if let Err(e) = receiver.send(frame).await {
			warn!("stage receiver rejected a frame: {}", e);
		}
		if is_done {
			remaining -= 1;
		}
	}
	Ok(())
}

async fn serve_supply<S>(
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
	paths: &[String],
	signatures: &[Signature],
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	struct BorrowedWireSink<'a, S> {
		writer: &'a mut WriteHalf<S>,
	}

	#[async_trait]
	impl<'a, S: AsyncRead + AsyncWrite + Send + 'static> FrameSink for BorrowedWireSink<'a, S> {
		async fn send(&mut self, frame: StreamMessage) -> Result<(), RsyncError> {
			write_frame(self.writer, &frame)
				.await
				.map_err(|e| RsyncError::Io(std::io::Error::other(e.to_string())))
		}
	}

	let mut sink = BorrowedWireSink { writer };
	endpoint.supply(paths, signatures, &mut sink).await
}

async fn serve_transition<S>(
	writer: &mut WriteHalf<S>,
	endpoint: &mut LocalEndpoint,
	changes: &[Change],
) -> Result<(), SyncError>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let response = match endpoint.transition(changes).await {
		Ok(outcome) => TransitionResponse {
			results: outcome.results,
			problems: outcome.problems,
			stager_missing_files: outcome.stager_missing_files,
			made_changes: outcome.made_changes,
			error: None,
		},
		Err(e) => TransitionResponse {
			results: Vec::new(),
			problems: Vec::new(),
			stager_missing_files: false,
			made_changes: false,
			error: Some(e.to_string()),
		},
	};
	write_frame(writer, &response).await.map_err(SyncError::Protocol)
}


// vim: ts=4
