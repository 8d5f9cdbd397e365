//! The endpoint contract: the controller drives one endpoint per side of a
//! session through `poll`/`scan`/`stage`/`supply`/`transition`/`shutdown`,
//! never calling more than one method on the same endpoint concurrently.

mod local;

pub use local::LocalEndpoint;

use async_trait::async_trait;

use crate::entry::Snapshot;
use crate::error::SyncError;
use crate::reconciler::Change;
use crate::rsync::{FrameSink, Signature};
use crate::transitioner::TransitionOutcome;

/// Outcome of `scan`. `Retry` asks the controller to sleep and call again,
/// possibly with `full=true` the second time.
pub enum ScanResult {
	Ready { snapshot: Snapshot, preserves_executability: bool },
	Retry,
}

/// Outcome of `stage`: the subset of the requested paths this endpoint
/// actually needs content for, their base signatures (an empty signature
/// when the path does not exist here yet), and a sink that accepts the
/// rsync transmission stream the controller will feed from the opposite
/// side's `supply` call, one file at a time in `filtered_paths` order.
pub struct StageOutcome {
	pub filtered_paths: Vec<String>,
	pub signatures: Vec<Signature>,
	pub receiver: Box<dyn FrameSink + Send>,
}

impl std::fmt::Debug for StageOutcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StageOutcome")
			.field("filtered_paths", &self.filtered_paths)
			.field("signatures", &self.signatures)
			.field("receiver", &"<dyn FrameSink>")
			.finish()
	}
}

#[async_trait]
pub trait Endpoint: Send {
	/// Blocks until a change has been observed or `cancelled` resolves. An
	/// endpoint may return immediately on its very first call.
	async fn poll(&mut self, cancelled: &mut (dyn FnMut() -> bool + Send)) -> Result<(), SyncError>;

	/// Scans this endpoint's root. `full=false` permits an accelerated scan
	/// against `ancestor` + the watcher's recheck set when available.
	async fn scan(&mut self, ancestor: &Snapshot, full: bool) -> Result<ScanResult, SyncError>;

	/// Filters `paths` down to those this endpoint still needs content for
	/// (excluding anything already staged or reverse-lookup-satisfied) and
	/// returns their base signatures.
	async fn stage(&mut self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome, SyncError>;

	/// Transmits deltified content for `paths` against `signatures` to
	/// `sink`, one `transmit_file` call per path.
	async fn supply(&mut self, paths: &[String], signatures: &[Signature], sink: &mut (dyn FrameSink + Send)) -> Result<(), SyncError>;

	/// Waits for any content a prior `stage` call is still receiving, then
	/// applies `changes` to the live filesystem and wipes the stager.
	async fn transition(&mut self, changes: &[Change]) -> Result<TransitionOutcome, SyncError>;

	/// Cancels background workers (watcher, cache saver) and releases
	/// resources. Idempotent.
	async fn shutdown(&mut self);
}

// vim: ts=4
