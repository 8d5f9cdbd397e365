//! Wire message types for the remote endpoint: the handshake records plus
//! the request/response taxonomy that rides the length-delimited frames
//! from `frame.rs`.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfiguration;
use crate::entry::Snapshot;
use crate::reconciler::Change;
use crate::rsync::{Operation, Signature};
use crate::scanner::Problem;
use crate::transitioner::TransitionResult;

/// Sent by the dialing side immediately after the connection opens, before
/// either side's version bytes.
pub const CLIENT_MAGIC: [u8; 8] = *b"MTGNclnt";
/// Sent by the accepting side in reply, so a client that dialed the wrong
/// kind of listener fails the handshake instead of hanging.
pub const SERVER_MAGIC: [u8; 8] = *b"MTGNsrvr";

/// This build's protocol version. Compatibility requires exact equality;
/// there is no cross-version negotiation to fall back to yet.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (1, 0, 0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
	pub session: String,
	pub alpha: bool,
	pub root: String,
	pub configuration: SessionConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
	pub error: Option<String>,
}

/// Everything the client may ask of a remote endpoint after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EndpointRequest {
	Poll,
	/// May arrive before or after the matching `PollResponse`; the server
	/// answers it exactly once regardless of ordering.
	PollCompletion,
	Scan {
		ancestor: Snapshot,
		full: bool,
		/// Set after a failed delta application to force the server to
		/// deltify against an empty baseline, which degrades to raw content.
		force_full_snapshot: bool,
	},
	Stage {
		paths: Vec<String>,
		digests: Vec<Vec<u8>>,
	},
	Supply {
		paths: Vec<String>,
		signatures: Vec<Signature>,
	},
	Transition {
		changes: Vec<Change>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
	pub error: Option<String>,
}

/// `snapshot_delta` reconstructs against the baseline the client already
/// holds (its previous snapshot, or the ancestor on the very first scan);
/// see `remote.rs` for the rolling-baseline bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
	pub snapshot_delta: Vec<Operation>,
	pub preserves_executability: bool,
	pub try_again: bool,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResponse {
	pub paths: Vec<String>,
	pub signatures: Vec<Signature>,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResponse {
	pub results: Vec<TransitionResult>,
	pub problems: Vec<Problem>,
	pub stager_missing_files: bool,
	pub made_changes: bool,
	pub error: Option<String>,
}

// vim: ts=4
