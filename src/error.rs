//! Error types for the synchronization core.

use std::error::Error;
use std::fmt;
use std::io;

/// Severity taxonomy. `SyncError::classify()` maps every variant to one of
/// these so the controller can dispatch without matching concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Retryable: recorded on state, sleep with backoff, retry next cycle.
	Transient,
	/// Reported, non-fatal; aggregated into `problems` lists.
	Problem,
	/// Reported, non-fatal; surfaced until the user resolves it.
	Conflict,
	/// Session-terminal until user action.
	Halt,
	/// Fatal for the current connection; close and reconnect.
	Protocol,
	/// Session-wide fatal; the session refuses to run.
	Fatal,
}

/// Unified error type for all fallible core operations.
#[derive(Debug)]
pub enum SyncError {
	Io(io::Error),
	Scan(ScanError),
	Rsync(RsyncError),
	Stage(StageError),
	Transition(TransitionError),
	Protocol(ProtocolError),
	Config(ConfigError),
	Persistence(PersistenceError),
	/// Root was deleted, emptied against policy, or changed type.
	Halted { reason: String },
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Scan(e) => write!(f, "scan error: {}", e),
			SyncError::Rsync(e) => write!(f, "rsync error: {}", e),
			SyncError::Stage(e) => write!(f, "stage error: {}", e),
			SyncError::Transition(e) => write!(f, "transition error: {}", e),
			SyncError::Protocol(e) => write!(f, "protocol error: {}", e),
			SyncError::Config(e) => write!(f, "configuration error: {}", e),
			SyncError::Persistence(e) => write!(f, "persistence error: {}", e),
			SyncError::Halted { reason } => write!(f, "session halted: {}", reason),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl SyncError {
	pub fn classify(&self) -> ErrorClass {
		match self {
			SyncError::Io(_) => ErrorClass::Transient,
			SyncError::Scan(e) => e.classify(),
			SyncError::Rsync(_) => ErrorClass::Protocol,
			SyncError::Stage(_) => ErrorClass::Problem,
			SyncError::Transition(_) => ErrorClass::Problem,
			SyncError::Protocol(_) => ErrorClass::Protocol,
			SyncError::Config(_) => ErrorClass::Fatal,
			SyncError::Persistence(_) => ErrorClass::Fatal,
			SyncError::Halted { .. } => ErrorClass::Halt,
			SyncError::Other { .. } => ErrorClass::Fatal,
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

macro_rules! nest_error {
	($variant:ident, $ty:ident) => {
		impl From<$ty> for SyncError {
			fn from(e: $ty) -> Self {
				SyncError::$variant(e)
			}
		}
	};
}

nest_error!(Scan, ScanError);
nest_error!(Rsync, RsyncError);
nest_error!(Stage, StageError);
nest_error!(Transition, TransitionError);
nest_error!(Protocol, ProtocolError);
nest_error!(Config, ConfigError);
nest_error!(Persistence, PersistenceError);

/// Errors raised while scanning a filesystem root.
#[derive(Debug)]
pub enum ScanError {
	/// Filesystem state changed underfoot (a path vanished between stat and
	/// read); the caller should retry.
	Transient { path: String, source: io::Error },
	/// A path could not be read at all; becomes a `problem` entry rather
	/// than aborting the scan.
	Permanent { path: String, message: String },
	/// The root itself is not accessible.
	RootUnreadable { path: String, source: io::Error },
}

impl ScanError {
	pub fn classify(&self) -> ErrorClass {
		match self {
			ScanError::Transient { .. } => ErrorClass::Transient,
			ScanError::Permanent { .. } => ErrorClass::Problem,
			ScanError::RootUnreadable { .. } => ErrorClass::Transient,
		}
	}
}

impl fmt::Display for ScanError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ScanError::Transient { path, source } => {
				write!(f, "transient scan failure at {}: {}", path, source)
			}
			ScanError::Permanent { path, message } => {
				write!(f, "cannot scan {}: {}", path, message)
			}
			ScanError::RootUnreadable { path, source } => {
				write!(f, "root {} unreadable: {}", path, source)
			}
		}
	}
}

impl Error for ScanError {}

/// Errors raised by the rsync signature/delta/patch engine.
#[derive(Debug)]
pub enum RsyncError {
	MalformedSignature { message: String },
	MalformedOperation { message: String },
	Io(io::Error),
}

impl fmt::Display for RsyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RsyncError::MalformedSignature { message } => {
				write!(f, "malformed signature: {}", message)
			}
			RsyncError::MalformedOperation { message } => {
				write!(f, "malformed operation: {}", message)
			}
			RsyncError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for RsyncError {}

impl From<io::Error> for RsyncError {
	fn from(e: io::Error) -> Self {
		RsyncError::Io(e)
	}
}

/// Errors raised by the content-addressed stager.
#[derive(Debug)]
pub enum StageError {
	DigestMismatch { expected: String, actual: String },
	SizeLimitExceeded { path: String, limit: u64 },
	NotFound { path: String },
	Io(io::Error),
}

impl fmt::Display for StageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StageError::DigestMismatch { expected, actual } => {
				write!(f, "digest mismatch: expected {}, got {}", expected, actual)
			}
			StageError::SizeLimitExceeded { path, limit } => {
				write!(f, "{} exceeds the {} byte staging limit", path, limit)
			}
			StageError::NotFound { path } => write!(f, "{} is not staged", path),
			StageError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for StageError {}

impl From<io::Error> for StageError {
	fn from(e: io::Error) -> Self {
		StageError::Io(e)
	}
}

/// Errors raised while applying changes to a live filesystem.
#[derive(Debug)]
pub enum TransitionError {
	PreconditionMismatch { path: String },
	ContentMissing { path: String },
	Io { path: String, source: io::Error },
}

impl fmt::Display for TransitionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransitionError::PreconditionMismatch { path } => {
				write!(f, "{} no longer matches the expected state", path)
			}
			TransitionError::ContentMissing { path } => {
				write!(f, "staged content for {} is missing", path)
			}
			TransitionError::Io { path, source } => write!(f, "{}: {}", path, source),
		}
	}
}

impl Error for TransitionError {}

/// Errors raised by the remote endpoint wire codec.
#[derive(Debug)]
pub enum ProtocolError {
	MagicMismatch,
	VersionMismatch { local: (u32, u32, u32), remote: (u32, u32, u32) },
	Framing { message: String },
	Decode { message: String },
	Closed,
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::MagicMismatch => write!(f, "handshake magic mismatch"),
			ProtocolError::VersionMismatch { local, remote } => write!(
				f,
				"version mismatch: local={}.{}.{}, remote={}.{}.{}",
				local.0, local.1, local.2, remote.0, remote.1, remote.2
			),
			ProtocolError::Framing { message } => write!(f, "framing error: {}", message),
			ProtocolError::Decode { message } => write!(f, "decode error: {}", message),
			ProtocolError::Closed => write!(f, "connection closed"),
		}
	}
}

impl Error for ProtocolError {}

/// Errors in session/endpoint configuration.
#[derive(Debug)]
pub enum ConfigError {
	InvalidValue { field: String, message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::InvalidValue { field, message } => {
				write!(f, "invalid {}: {}", field, message)
			}
		}
	}
}

impl Error for ConfigError {}

/// Errors reading or writing persisted records (sessions, archives, caches).
#[derive(Debug)]
pub enum PersistenceError {
	Corrupted { path: String, message: String },
	Io { path: String, source: io::Error },
}

impl fmt::Display for PersistenceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PersistenceError::Corrupted { path, message } => {
				write!(f, "{} is corrupted: {}", path, message)
			}
			PersistenceError::Io { path, source } => write!(f, "{}: {}", path, source),
		}
	}
}

impl Error for PersistenceError {}

// vim: ts=4
