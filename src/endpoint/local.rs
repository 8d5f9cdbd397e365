//! `LocalEndpoint`: composes the scanner, cache, stager, transitioner, and
//! watcher into one side of a session backed by a live filesystem root.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::{Cache, IgnoreCache};
use crate::config::{ScanMode, SessionConfiguration, SymlinkMode};
use crate::entry::Snapshot;
use crate::error::{ConfigError, RsyncError, ScanError, StageError, SyncError};
use crate::exclusion::ExclusionEngine;
use crate::reconciler::Change;
use crate::rsync::{self, signature, FrameSink, FrameSource, Signature, StreamMessage};
use crate::scanner::{self, Problem};
use crate::stager::Stager;
use crate::transitioner::{apply_transition, TransitionOutcome};
use crate::watcher::Watcher;

use super::{Endpoint, ScanResult, StageOutcome};

/// Maximum bytes carried by a single `Operation::Data` frame; kept well
/// under typical frame/socket buffer sizes.
const MAX_DATA_OP_SIZE: usize = 64 * 1024;

const CACHE_SAVE_INTERVAL: Duration = Duration::from_secs(60);

pub struct LocalEndpoint {
	root: PathBuf,
	config: SessionConfiguration,
	read_only: bool,
	ignores: ExclusionEngine,
	ignore_cache: IgnoreCache,
	stager: Stager,
	watcher: Watcher,
	cache: Arc<Mutex<Cache>>,
	cache_saver: Option<JoinHandle<()>>,
	cache_save_error: Arc<Mutex<Option<String>>>,
	last_snapshot: Snapshot,
	last_entry_count: usize,
	last_preserves_executability: bool,
	/// Cleared by `transition` before it touches the filesystem and set
	/// again by the next successful scan, so a post-transition cycle never
	/// reuses a pre-transition baseline.
	accelerate: bool,
	scanned_since_stage: bool,
	scanned_since_transition: bool,
	pending_receives: Vec<oneshot::Receiver<Vec<Problem>>>,
}

impl LocalEndpoint {
	pub fn new(root: PathBuf, cache_path: PathBuf, stage_root: PathBuf, config: SessionConfiguration, read_only: bool) -> Result<Self, SyncError> {
		let ignores = ExclusionEngine::new(&config.ignore_patterns)
			.map_err(|e| SyncError::Config(ConfigError::InvalidValue { field: "ignore_patterns".to_string(), message: e.to_string() }))?;
		let cache = Arc::new(Mutex::new(Cache::open(&cache_path)?));
		let stager = Stager::new(stage_root, None, config.hash_algorithm);

		// Poll-mode watching re-scans on a timer and compares snapshots, so
		// it needs its own scan closure over the shared cache.
		let poll_snapshot = Some(Self::poll_snapshot_provider(root.clone(), cache.clone(), &config));
		let watcher = Watcher::spawn(root.clone(), config.watch_mode, config.max_entry_count.min(65_536), poll_snapshot);

		let cache_save_error = Arc::new(Mutex::new(None));
		let cache_saver = Some(Self::spawn_cache_saver(cache.clone(), cache_save_error.clone()));

		Ok(Self {
			root,
			config,
			read_only,
			ignores,
			ignore_cache: IgnoreCache::new(),
			stager,
			watcher,
			cache,
			cache_saver,
			cache_save_error,
			last_snapshot: None,
			last_entry_count: 0,
			last_preserves_executability: true,
			accelerate: false,
			scanned_since_stage: false,
			scanned_since_transition: false,
			pending_receives: Vec::new(),
		})
	}

	fn poll_snapshot_provider(root: PathBuf, cache: Arc<Mutex<Cache>>, config: &SessionConfiguration) -> crate::watcher::SnapshotProvider {
		let patterns = config.ignore_patterns.clone();
		let hash_algorithm = config.hash_algorithm;
		let symlink_mode = config.symlink_mode;
		Arc::new(move || {
			let root = root.clone();
			let cache = cache.clone();
			let patterns = patterns.clone();
			Box::pin(async move {
				let ignores = match ExclusionEngine::new(&patterns) {
					Ok(engine) => engine,
					Err(_) => return None,
				};
				let mut ignore_cache = IgnoreCache::new();
				let mut cache = cache.lock().await;
				match scanner::scan_warm(&root, &mut cache, &mut ignore_cache, &ignores, hash_algorithm, symlink_mode).await {
					Ok(outcome) => outcome.snapshot,
					Err(_) => None,
				}
			})
		})
	}

	fn spawn_cache_saver(cache: Arc<Mutex<Cache>>, error_slot: Arc<Mutex<Option<String>>>) -> JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(CACHE_SAVE_INTERVAL).await;
				let mut guard = cache.lock().await;
				if !guard.is_dirty() {
					continue;
				}
				if let Err(e) = guard.persist() {
					*error_slot.lock().await = Some(e.to_string());
				}
			}
		})
	}

	/// Drains any in-flight receive tasks started by a previous `stage`
	/// call, surfacing their problems.
	async fn drain_pending_receives(&mut self) -> Vec<Problem> {
		let mut problems = Vec::new();
		for rx in self.pending_receives.drain(..) {
			if let Ok(p) = rx.await {
				problems.extend(p);
			}
		}
		problems
	}

	fn entry_count(snapshot: &Snapshot) -> usize {
		fn walk(entry: &crate::entry::Entry, count: &mut usize) {
			*count += 1;
			if let crate::entry::Entry::Directory { contents } = entry {
				for child in contents.values() {
					walk(child, count);
				}
			}
		}
		let mut count = 0;
		if let Some(root) = snapshot {
			walk(root, &mut count);
		}
		count
	}
}

/// Either a real file or an empty stand-in, so the receive path can always
/// hand `rsync::receive_file` a `AsyncRead + AsyncSeek` base whether or not
/// the path previously existed here.
enum LocalBase {
	File(tokio::fs::File),
	Empty(io::Cursor<Vec<u8>>),
}

impl AsyncRead for LocalBase {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			LocalBase::File(f) => Pin::new(f).poll_read(cx, buf),
			LocalBase::Empty(c) => Pin::new(c).poll_read(cx, buf),
		}
	}
}

impl AsyncSeek for LocalBase {
	fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
		match self.get_mut() {
			LocalBase::File(f) => Pin::new(f).start_seek(position),
			LocalBase::Empty(c) => Pin::new(c).start_seek(position),
		}
	}

	fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
		match self.get_mut() {
			LocalBase::File(f) => Pin::new(f).poll_complete(cx),
			LocalBase::Empty(c) => Pin::new(c).poll_complete(cx),
		}
	}
}

async fn open_base(root: &Path, path: &str) -> LocalBase {
	match tokio::fs::File::open(root.join(path)).await {
		Ok(file) => LocalBase::File(file),
		Err(_) => LocalBase::Empty(io::Cursor::new(Vec::new())),
	}
}

/// Feeds frames pushed from `supply` into a bounded-by-nothing channel that
/// the matching `stage` call's background task pulls from.
struct ChannelReceiveSink {
	tx: mpsc::UnboundedSender<StreamMessage>,
}

#[async_trait]
impl FrameSink for ChannelReceiveSink {
	async fn send(&mut self, frame: StreamMessage) -> Result<(), RsyncError> {
		self.tx.send(frame).map_err(|_| RsyncError::MalformedOperation { message: "stage receiver task has exited".to_string() })
	}
}

struct ChannelReceiveSource {
	rx: mpsc::UnboundedReceiver<StreamMessage>,
}

#[async_trait]
impl FrameSource for ChannelReceiveSource {
	async fn recv(&mut self) -> Result<Option<StreamMessage>, RsyncError> {
		Ok(self.rx.recv().await)
	}
}

#[async_trait]
impl Endpoint for LocalEndpoint {
	async fn poll(&mut self, cancelled: &mut (dyn FnMut() -> bool + Send)) -> Result<(), SyncError> {
		loop {
			if cancelled() {
				return Ok(());
			}
			tokio::select! {
				_ = self.watcher.notified() => return Ok(()),
				_ = tokio::time::sleep(Duration::from_millis(200)) => continue,
			}
		}
	}

	async fn scan(&mut self, ancestor: &Snapshot, full: bool) -> Result<ScanResult, SyncError> {
		// Surface any cache-saver failure since the previous scan.
		if let Some(message) = self.cache_save_error.lock().await.take() {
			warn!("cache persistence failed for {}: {}", self.root.display(), message);
		}

		let mut cache = self.cache.lock().await;
		let use_accelerated = !full && self.config.scan_mode == ScanMode::Accelerated && self.accelerate;

		let result = if use_accelerated {
			let (recheck_paths, overflowed) = self.watcher.take_recheck_paths();
			if overflowed {
				scanner::scan_warm(&self.root, &mut cache, &mut self.ignore_cache, &self.ignores, self.config.hash_algorithm, self.config.symlink_mode).await
			} else if recheck_paths.is_empty() && self.last_snapshot.is_some() {
				Ok(scanner::ScanOutcome { snapshot: self.last_snapshot.clone(), preserves_executability: self.last_preserves_executability, decomposes_unicode: false, problems: Vec::new() })
			} else {
				let baseline = if self.last_snapshot.is_some() { &self.last_snapshot } else { ancestor };
				scanner::scan_accelerated(
					&self.root,
					baseline,
					&recheck_paths,
					&mut cache,
					&mut self.ignore_cache,
					&self.ignores,
					self.config.hash_algorithm,
					self.config.symlink_mode,
				)
				.await
			}
		} else {
			// A warm scan supersedes anything accumulated so far; drain so
			// stale paths are not re-checked next cycle. Events arriving
			// during the scan re-accumulate behind it.
			let _ = self.watcher.take_recheck_paths();
			scanner::scan_warm(&self.root, &mut cache, &mut self.ignore_cache, &self.ignores, self.config.hash_algorithm, self.config.symlink_mode).await
		};
		drop(cache);

		// A filesystem race during the scan asks the controller to retry,
		// possibly with `full=true`; only permanent failures are errors.
		let outcome = match result {
			Ok(outcome) => outcome,
			Err(ScanError::Transient { .. }) | Err(ScanError::RootUnreadable { .. }) => return Ok(ScanResult::Retry),
			Err(e) => return Err(e.into()),
		};

		let entry_count = Self::entry_count(&outcome.snapshot);
		if entry_count > self.config.max_entry_count {
			return Err(SyncError::Other { message: format!("{} exceeds the configured maximum entry count", self.root.display()) });
		}

		self.last_entry_count = entry_count;
		self.last_snapshot = outcome.snapshot.clone();
		self.last_preserves_executability = outcome.preserves_executability;
		self.accelerate = true;
		self.scanned_since_stage = true;
		self.scanned_since_transition = true;

		Ok(ScanResult::Ready { snapshot: outcome.snapshot, preserves_executability: outcome.preserves_executability })
	}

	async fn stage(&mut self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome, SyncError> {
		if self.read_only {
			return Err(SyncError::Other { message: "stage invoked on a read-only endpoint".to_string() });
		}
		if !self.scanned_since_stage {
			return Err(SyncError::Other { message: "stage called without an intervening scan".to_string() });
		}
		if paths.len() > self.config.max_entry_count.saturating_sub(self.last_entry_count) {
			return Err(SyncError::Other { message: "stage request exceeds the configured maximum entry count".to_string() });
		}
		self.scanned_since_stage = false;

		let cache = self.cache.lock().await;
		let mut filtered_paths = Vec::new();
		let mut signatures = Vec::new();

		for (path, digest) in paths.iter().zip(digests.iter()) {
			if self.stager.provide(path, digest).await.is_ok() {
				continue;
			}
			if let Some(existing) = self.stager.reverse_lookup(&cache, &self.root, digest) {
				let mut sink = self.stager.sink(path).await?;
				let bytes = tokio::fs::read(&existing).await.map_err(StageError::Io)?;
				sink.write(&bytes).await?;
				sink.commit().await?;
				continue;
			}

			let base_signature = match open_base(&self.root, path).await {
				LocalBase::File(file) => {
					let len = file.metadata().await.map_err(RsyncError::Io)?.len();
					signature(file, len, 0, self.config.hash_algorithm).await?
				}
				LocalBase::Empty(_) => signature(tokio::io::empty(), 0, 0, self.config.hash_algorithm).await?,
			};
			filtered_paths.push(path.clone());
			signatures.push(base_signature);
		}
		drop(cache);

		let (tx, rx) = mpsc::unbounded_channel::<StreamMessage>();
		let (done_tx, done_rx) = oneshot::channel();
		let stager = self.stager.clone();
		let root = self.root.clone();
		let receive_paths = filtered_paths.clone();
		let receive_signatures = signatures.clone();

		tokio::spawn(async move {
			let mut source = ChannelReceiveSource { rx };
			let mut problems = Vec::new();
			for (path, sig) in receive_paths.into_iter().zip(receive_signatures.into_iter()) {
				let base = open_base(&root, &path).await;
				let mut sink = match stager.sink(&path).await {
					Ok(s) => s,
					Err(e) => {
						problems.push(Problem { path, message: e.to_string() });
						continue;
					}
				};
				// `&mut sink` rather than `sink` so ownership stays here for
				// the commit/discard below; `receive_file` only needs
				// `AsyncWrite`, which a `&mut StagingSink` satisfies too.
				match rsync::receive_file(&mut source, &mut sink, base, &sig).await {
					Ok(Some(message)) => {
						let _ = sink.discard().await;
						problems.push(Problem { path, message });
					}
					Ok(None) => {
						if let Err(e) = sink.commit().await {
							problems.push(Problem { path, message: e.to_string() });
						}
					}
					Err(e) => {
						let _ = sink.discard().await;
						problems.push(Problem { path, message: e.to_string() });
						break;
					}
				}
			}
			let _ = done_tx.send(problems);
		});

		self.pending_receives.push(done_rx);

		Ok(StageOutcome { filtered_paths, signatures, receiver: Box::new(ChannelReceiveSink { tx }) })
	}

	async fn supply(&mut self, paths: &[String], signatures: &[Signature], sink: &mut (dyn FrameSink + Send)) -> Result<(), SyncError> {
		for (path, sig) in paths.iter().zip(signatures.iter()) {
			match tokio::fs::File::open(self.root.join(path)).await {
				Ok(file) => {
					let expected_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
					rsync::transmit_file(file, sig, MAX_DATA_OP_SIZE, expected_size, sink).await?;
				}
				Err(_) => {
					rsync::transmit_file(tokio::io::empty(), sig, MAX_DATA_OP_SIZE, 0, sink).await?;
				}
			}
		}
		Ok(())
	}

	async fn transition(&mut self, changes: &[Change]) -> Result<TransitionOutcome, SyncError> {
		if self.read_only {
			return Err(SyncError::Other { message: "transition invoked on a read-only endpoint".to_string() });
		}
		if !self.scanned_since_transition {
			return Err(SyncError::Other { message: "transition called without an intervening scan".to_string() });
		}
		if changes.len() > self.config.max_entry_count {
			return Err(SyncError::Other { message: "transition request exceeds the configured maximum entry count".to_string() });
		}
		self.scanned_since_transition = false;
		self.accelerate = false;

		let receive_problems = self.drain_pending_receives().await;
		let cache = self.cache.lock().await;

		let symlink_mode: SymlinkMode = self.config.symlink_mode;
		let mut outcome = apply_transition(
			&self.root,
			changes,
			&self.stager,
			&cache,
			symlink_mode,
			self.config.permission_mode,
			self.config.default_file_mode,
			self.config.default_directory_mode,
		)
		.await;
		drop(cache);

		outcome.problems.extend(receive_problems);
		if let Err(e) = self.stager.wipe().await {
			outcome.problems.push(Problem { path: String::new(), message: format!("failed to wipe stager: {}", e) });
		}

		Ok(outcome)
	}

	async fn shutdown(&mut self) {
		self.watcher.shutdown();
		if let Some(handle) = self.cache_saver.take() {
			handle.abort();
		}
		let mut cache = self.cache.lock().await;
		if cache.is_dirty() {
			if let Err(e) = cache.persist() {
				warn!("final cache persistence failed for {}: {}", self.root.display(), e);
			}
		}
		if let Err(e) = self.stager.wipe().await {
			warn!("failed to wipe stager for {} on shutdown: {}", self.root.display(), e);
		}
	}
}


// vim: ts=4
