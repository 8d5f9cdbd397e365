//! The per-session controller: a state machine driving
//! repeated cycles of watching, scanning, reconciling, staging,
//! transitioning, and saving across two endpoints, with reconnect backoff
//! and halt/pause/resume handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, ScanResult};
use crate::entry::{replace_at, Entry, Snapshot};
use crate::error::{ErrorClass, SyncError};
use crate::reconciler::{reconcile, staging_targets, Change};
use crate::session::{DataDirectory, Session, SessionState, SessionStatus};

/// Fallback wake-up while watching, for endpoints whose watcher is disabled
/// or lossy.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Sleep before re-scanning with `full=true` after a transient scan error.
const RESCAN_WAIT: Duration = Duration::from_secs(5);

/// Exponential reconnect backoff: initial 1 s, doubling to a 60 s cap.
pub struct Backoff {
	initial: Duration,
	max: Duration,
	current: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Backoff { initial, max, current: initial }
	}

	/// The next delay to sleep; doubles on each call until the cap.
	pub fn next(&mut self) -> Duration {
		let delay = self.current;
		self.current = (self.current * 2).min(self.max);
		delay
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
	}
}

/// Dials one side of a session. Transport concerns (SSH, containers, local
/// process) live behind this seam; the controller only sees `Endpoint`s.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
	async fn connect(&self, alpha: bool) -> Result<Box<dyn Endpoint>, SyncError>;
}

struct Shared {
	state: Mutex<SessionState>,
	paused: AtomicBool,
	cancelled: AtomicBool,
	resume: Notify,
}

/// Cloneable observer/control surface for a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
	shared: Arc<Shared>,
}

impl ControllerHandle {
	pub async fn state(&self) -> SessionState {
		self.shared.state.lock().await.clone()
	}

	/// Cancels the current cycle at its next cancellation point and shuts
	/// down both endpoints.
	pub fn pause(&self) {
		self.shared.paused.store(true, Ordering::Release);
	}

	/// Reopens endpoints, clearing a halt state if one was entered.
	pub fn resume(&self) {
		self.shared.paused.store(false, Ordering::Release);
		// notify_one stores a permit, so a resume that races the run loop's
		// own await is never lost.
		self.shared.resume.notify_one();
	}

	/// Terminates the controller loop entirely.
	pub fn stop(&self) {
		self.shared.cancelled.store(true, Ordering::Release);
		self.shared.resume.notify_one();
	}
}

pub struct Controller {
	session: Session,
	data: DataDirectory,
	connector: Box<dyn EndpointConnector>,
	ancestor: Snapshot,
	shared: Arc<Shared>,
}

impl Controller {
	/// Loads (or initializes) the session's archive and persists the
	/// session record, ready for `run`.
	pub async fn new(session: Session, data: DataDirectory, connector: Box<dyn EndpointConnector>) -> Result<Self, SyncError> {
		let ancestor = data.load_archive(&session.identifier).await?;
		data.save_session(&session).await?;
		let shared = Arc::new(Shared {
			state: Mutex::new(SessionState::default()),
			paused: AtomicBool::new(session.paused),
			cancelled: AtomicBool::new(false),
			resume: Notify::new(),
		});
		Ok(Controller { session, data, connector, ancestor, shared })
	}

	pub fn handle(&self) -> ControllerHandle {
		ControllerHandle { shared: self.shared.clone() }
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	/// Drives the session until `stop` is called: connect both endpoints,
	/// synchronize until an error, shut down, and reconnect with backoff.
	pub async fn run(mut self) {
		let mut backoff = Backoff::default();

		loop {
			if self.cancelled() {
				break;
			}
			if self.paused() {
				self.set_status(SessionStatus::Disconnected).await;
				self.shared.resume.notified().await;
				continue;
			}

			self.set_status(SessionStatus::ConnectingAlpha).await;
			let mut alpha = match self.connector.connect(true).await {
				Ok(endpoint) => endpoint,
				Err(e) => {
					self.record_error(&e).await;
					self.set_status(SessionStatus::Disconnected).await;
					tokio::time::sleep(backoff.next()).await;
					continue;
				}
			};
			self.set_connected(true, true).await;

			self.set_status(SessionStatus::ConnectingBeta).await;
			let mut beta = match self.connector.connect(false).await {
				Ok(endpoint) => endpoint,
				Err(e) => {
					alpha.shutdown().await;
					self.set_connected(true, false).await;
					self.record_error(&e).await;
					self.set_status(SessionStatus::Disconnected).await;
					tokio::time::sleep(backoff.next()).await;
					continue;
				}
			};
			self.set_connected(false, true).await;
			backoff.reset();

			let outcome = self.synchronize(alpha.as_mut(), beta.as_mut()).await;

			alpha.shutdown().await;
			beta.shutdown().await;
			self.set_connected(true, false).await;
			self.set_connected(false, false).await;

			match outcome {
				Ok(()) => {
					// Cancelled or paused; the loop head handles both.
				}
				Err(e) => match e.classify() {
					ErrorClass::Halt => {
						warn!("session {} halted: {}", self.session.identifier, e);
						self.record_error(&e).await;
						// Status was already set to the specific halt state;
						// hold it until the user resumes or stops.
						self.shared.resume.notified().await;
					}
					ErrorClass::Fatal => {
						warn!("session {} cannot run: {}", self.session.identifier, e);
						self.record_error(&e).await;
						self.set_status(SessionStatus::Disconnected).await;
						break;
					}
					_ => {
						debug!("session {} cycle failed, reconnecting: {}", self.session.identifier, e);
						self.record_error(&e).await;
						self.set_status(SessionStatus::Disconnected).await;
						tokio::time::sleep(backoff.next()).await;
					}
				},
			}
		}

		self.set_status(SessionStatus::Disconnected).await;
	}

	/// One connection's worth of synchronization cycles. Returns `Ok(())`
	/// on pause/stop and an error on anything that requires reconnecting or
	/// halting.
	async fn synchronize(&mut self, alpha: &mut dyn Endpoint, beta: &mut dyn Endpoint) -> Result<(), SyncError> {
		let mut first_cycle = true;

		loop {
			if self.interrupted() {
				return Ok(());
			}

			// Watching. The very first cycle skips polling so a freshly
			// resumed session converges immediately.
			if !first_cycle {
				self.set_status(SessionStatus::Watching).await;
				self.poll_both(alpha, beta).await?;
			}
			first_cycle = false;
			if self.interrupted() {
				return Ok(());
			}

			// Scanning, with the transient-retry path.
			self.set_status(SessionStatus::Scanning).await;
			let Some((alpha_snapshot, beta_snapshot)) = self.scan_both(alpha, beta).await? else {
				return Ok(());
			};
			if self.interrupted() {
				return Ok(());
			}

			self.check_root_safety(&alpha_snapshot, "alpha").await?;
			self.check_root_safety(&beta_snapshot, "beta").await?;

			// Reconciling.
			self.set_status(SessionStatus::Reconciling).await;
			let reconciled = reconcile(&self.ancestor, &alpha_snapshot, &beta_snapshot, self.session.configuration.synchronization_mode);
			{
				let mut state = self.shared.state.lock().await;
				state.conflicts = reconciled.conflicts.clone();
			}
			if !reconciled.conflicts.is_empty() {
				info!("session {}: {} conflict(s) outstanding", self.session.identifier, reconciled.conflicts.len());
			}

			// Staging: each side that will transition stages the content it
			// is missing, supplied by the opposite side.
			if !reconciled.alpha_changes.is_empty() {
				self.set_status(SessionStatus::StagingAlpha).await;
				Self::stage_side(alpha, beta, &reconciled.alpha_changes).await?;
			}
			if !reconciled.beta_changes.is_empty() {
				self.set_status(SessionStatus::StagingBeta).await;
				Self::stage_side(beta, alpha, &reconciled.beta_changes).await?;
			}

			// Transitioning. Different endpoints may overlap; operations on
			// one side stay serial.
			self.set_status(SessionStatus::Transitioning).await;
			let (alpha_results, beta_results) = {
				let alpha_fut = async {
					if reconciled.alpha_changes.is_empty() {
						Ok(None)
					} else {
						alpha.transition(&reconciled.alpha_changes).await.map(Some)
					}
				};
				let beta_fut = async {
					if reconciled.beta_changes.is_empty() {
						Ok(None)
					} else {
						beta.transition(&reconciled.beta_changes).await.map(Some)
					}
				};
				let (a, b) = tokio::join!(alpha_fut, beta_fut);
				(a?, b?)
			};

			{
				let mut state = self.shared.state.lock().await;
				state.alpha_problems = alpha_results.as_ref().map(|o| o.problems.clone()).unwrap_or_default();
				state.beta_problems = beta_results.as_ref().map(|o| o.problems.clone()).unwrap_or_default();
				state.staging_retry_needed = alpha_results.as_ref().map(|o| o.stager_missing_files).unwrap_or(false)
					|| beta_results.as_ref().map(|o| o.stager_missing_files).unwrap_or(false);
			}

			// Saving: fold the reconciler's ancestor adoptions in first,
			// then overlay what each transition actually achieved, so a
			// failed change rolls its path back to the pre-cycle value.
			self.set_status(SessionStatus::Saving).await;
			let mut ancestor = self.ancestor.clone();
			for change in &reconciled.ancestor_changes {
				ancestor = replace_at(&ancestor, &change.path, change.new.clone());
			}
			for results in [&alpha_results, &beta_results] {
				if let Some(outcome) = results {
					for result in &outcome.results {
						ancestor = replace_at(&ancestor, &result.path, result.entry.clone());
					}
				}
			}
			self.ancestor = ancestor;
			self.data.save_archive(&self.session.identifier, &self.ancestor).await?;

			{
				let mut state = self.shared.state.lock().await;
				state.successful_cycles += 1;
				state.last_error = None;
				debug!("session {}: cycle {} complete", self.session.identifier, state.successful_cycles);
			}
		}
	}

	/// Stage content onto `receiver_side` for `changes`, supplied by
	/// `provider_side`. No-op when every needed digest is already present.
	async fn stage_side(
		receiver_side: &mut dyn Endpoint,
		provider_side: &mut dyn Endpoint,
		changes: &[Change],
	) -> Result<(), SyncError> {
		let (paths, digests) = staging_targets(changes);
		if paths.is_empty() {
			return Ok(());
		}
		let mut staged = receiver_side.stage(&paths, &digests).await?;
		if !staged.filtered_paths.is_empty() {
			provider_side.supply(&staged.filtered_paths, &staged.signatures, staged.receiver.as_mut()).await?;
		}
		Ok(())
	}

	/// Poll both endpoints concurrently; the first to observe a change (or
	/// a heartbeat timeout, or pause/stop) releases both.
	async fn poll_both(&self, alpha: &mut dyn Endpoint, beta: &mut dyn Endpoint) -> Result<(), SyncError> {
		let woke = Arc::new(AtomicBool::new(false));

		let make_cancel = |woke: Arc<AtomicBool>, shared: Arc<Shared>| {
			move || {
				woke.load(Ordering::Acquire)
					|| shared.cancelled.load(Ordering::Acquire)
					|| shared.paused.load(Ordering::Acquire)
			}
		};
		let mut cancel_alpha = make_cancel(woke.clone(), self.shared.clone());
		let mut cancel_beta = make_cancel(woke.clone(), self.shared.clone());

		let heartbeat = {
			let woke = woke.clone();
			tokio::spawn(async move {
				tokio::time::sleep(HEARTBEAT_INTERVAL).await;
				woke.store(true, Ordering::Release);
			})
		};

		let alpha_fut = async {
			let result = alpha.poll(&mut cancel_alpha).await;
			woke.store(true, Ordering::Release);
			result
		};
		let beta_fut = async {
			let result = beta.poll(&mut cancel_beta).await;
			woke.store(true, Ordering::Release);
			result
		};
		let (alpha_result, beta_result) = tokio::join!(alpha_fut, beta_fut);
		heartbeat.abort();
		alpha_result?;
		beta_result
	}

	/// Scan both sides; on a transient result, wait and re-scan with
	/// `full=true` until both sides produce a snapshot. `Ok(None)` means
	/// the wait was interrupted by pause or stop.
	async fn scan_both(&mut self, alpha: &mut dyn Endpoint, beta: &mut dyn Endpoint) -> Result<Option<(Snapshot, Snapshot)>, SyncError> {
		let mut full = false;
		loop {
			let (alpha_scan, beta_scan) = tokio::join!(alpha.scan(&self.ancestor, full), beta.scan(&self.ancestor, full));
			match (alpha_scan?, beta_scan?) {
				(ScanResult::Ready { snapshot: a, .. }, ScanResult::Ready { snapshot: b, .. }) => {
					return Ok(Some((a, b)));
				}
				_ => {
					if self.interrupted() {
						return Ok(None);
					}
					self.set_status(SessionStatus::WaitingForRescan).await;
					tokio::time::sleep(RESCAN_WAIT).await;
					self.set_status(SessionStatus::Scanning).await;
					full = true;
				}
			}
		}
	}

	/// Refuse to propagate root deletion, forbidden root emptying, or a
	/// root type change; halt instead.
	async fn check_root_safety(&self, snapshot: &Snapshot, side: &str) -> Result<(), SyncError> {
		let ancestor_root = self.ancestor.as_deref();
		let snapshot_root = snapshot.as_deref();

		match (ancestor_root, snapshot_root) {
			(Some(_), None) => {
				self.set_status(SessionStatus::HaltedOnRootDeletion).await;
				Err(SyncError::Halted { reason: format!("{} root was deleted", side) })
			}
			(Some(old), Some(new)) if old.kind() != new.kind() => {
				self.set_status(SessionStatus::HaltedOnRootTypeChange).await;
				Err(SyncError::Halted { reason: format!("{} root changed type", side) })
			}
			(Some(Entry::Directory { contents: old }), Some(Entry::Directory { contents: new }))
				if self.session.configuration.forbid_root_emptying && !old.is_empty() && new.is_empty() =>
			{
				self.set_status(SessionStatus::HaltedOnRootEmptied).await;
				Err(SyncError::Halted { reason: format!("{} root was emptied", side) })
			}
			_ => Ok(()),
		}
	}

	fn paused(&self) -> bool {
		self.shared.paused.load(Ordering::Acquire)
	}

	fn cancelled(&self) -> bool {
		self.shared.cancelled.load(Ordering::Acquire)
	}

	fn interrupted(&self) -> bool {
		self.paused() || self.cancelled()
	}

	async fn set_status(&self, status: SessionStatus) {
		let mut state = self.shared.state.lock().await;
		if state.status != status {
			debug!("session {}: {:?} -> {:?}", self.session.identifier, state.status, status);
			state.status = status;
		}
	}

	async fn set_connected(&self, alpha: bool, connected: bool) {
		let mut state = self.shared.state.lock().await;
		if alpha {
			state.alpha_connected = connected;
		} else {
			state.beta_connected = connected;
		}
	}

	async fn record_error(&self, error: &SyncError) {
		let mut state = self.shared.state.lock().await;
		state.last_error = Some(error.to_string());
	}
}


// vim: ts=4
