//! Background filesystem watching: native recursive events, periodic
//! polling, or disabled entirely, all funneled into a single one-slot
//! "modification observed" signal the controller awaits on.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::WatchMode;
use crate::entry::Snapshot;

const COALESCE_INTERVAL: Duration = Duration::from_millis(10);

/// Coalescing ticks between attempts to re-establish a lost native watch
/// (~5 s), e.g. after the watched root is first created.
const WATCH_RETRY_TICKS: u32 = 500;

pub type SnapshotProvider = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Snapshot> + Send>> + Send + Sync>;

/// Bounded accumulator of root-relative paths the controller should
/// re-scan. Overflowing it discards the partial set in favor of a full
/// warm re-scan, since a half-known set of touched paths is worse than
/// none once accelerated scanning can no longer trust it.
#[derive(Default)]
struct RecheckPaths {
	paths: HashSet<String>,
	capacity: usize,
	overflowed: bool,
}

impl RecheckPaths {
	fn new(capacity: usize) -> Self {
		Self { paths: HashSet::new(), capacity, overflowed: false }
	}

	fn insert(&mut self, path: String) {
		if self.overflowed {
			return;
		}
		self.paths.insert(path);
		if self.paths.len() > self.capacity {
			self.paths.clear();
			self.overflowed = true;
		}
	}

	fn take(&mut self) -> (Vec<String>, bool) {
		let overflowed = self.overflowed;
		let paths = std::mem::take(&mut self.paths).into_iter().collect();
		self.overflowed = false;
		(paths, overflowed)
	}

	/// Invalidate the accumulated set outright, forcing the next scan to be
	/// a full warm one. Used when a watch gap may have dropped events.
	fn force_overflow(&mut self) {
		self.paths.clear();
		self.overflowed = true;
	}
}

pub struct Watcher {
	notify_signal: Arc<Notify>,
	recheck: Arc<Mutex<RecheckPaths>>,
	shutdown: Arc<AtomicBool>,
	task: Option<JoinHandle<()>>,
	_native: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl Watcher {
	pub fn disabled() -> Self {
		Self {
			notify_signal: Arc::new(Notify::new()),
			recheck: Arc::new(Mutex::new(RecheckPaths::new(0))),
			shutdown: Arc::new(AtomicBool::new(false)),
			task: None,
			_native: Arc::new(Mutex::new(None)),
		}
	}

	pub fn spawn(root: PathBuf, mode: WatchMode, recheck_capacity: usize, poll_snapshot: Option<SnapshotProvider>) -> Self {
		match mode {
			WatchMode::Disabled => Self::disabled(),
			WatchMode::Recursive => Self::spawn_recursive(root, recheck_capacity),
			WatchMode::Poll { interval_seconds } => match poll_snapshot {
				Some(provider) => Self::spawn_poll(root, interval_seconds, provider),
				None => Self::disabled(),
			},
		}
	}

	fn spawn_recursive(root: PathBuf, recheck_capacity: usize) -> Self {
		let notify_signal = Arc::new(Notify::new());
		let recheck = Arc::new(Mutex::new(RecheckPaths::new(recheck_capacity)));
		let shutdown = Arc::new(AtomicBool::new(false));
		let dirty = Arc::new(AtomicBool::new(false));

		let native = Arc::new(Mutex::new(establish_watch(&root, recheck.clone(), dirty.clone())));

		let notify_for_task = notify_signal.clone();
		let shutdown_for_task = shutdown.clone();
		let native_for_task = native.clone();
		let recheck_for_task = recheck.clone();
		let dirty_for_task = dirty.clone();
		let root_for_task = root.clone();
		let task = tokio::spawn(async move {
			let mut ticks_without_watch = 0u32;
			loop {
				tokio::time::sleep(COALESCE_INTERVAL).await;
				if shutdown_for_task.load(Ordering::Acquire) {
					break;
				}
				if dirty_for_task.swap(false, Ordering::AcqRel) {
					notify_for_task.notify_one();
				}

				// Re-establish a missing watch on a timer, e.g. when the
				// root did not exist yet at session start.
				let absent = native_for_task.lock().unwrap().is_none();
				if !absent {
					ticks_without_watch = 0;
					continue;
				}
				ticks_without_watch += 1;
				if ticks_without_watch < WATCH_RETRY_TICKS {
					continue;
				}
				ticks_without_watch = 0;
				if let Some(watcher) = establish_watch(&root_for_task, recheck_for_task.clone(), dirty_for_task.clone()) {
					*native_for_task.lock().unwrap() = Some(watcher);
					// Events may have been dropped during the gap; the next
					// scan must not trust the accumulated set.
					recheck_for_task.lock().unwrap().force_overflow();
					dirty_for_task.store(true, Ordering::Release);
				}
			}
		});

		Self { notify_signal, recheck, shutdown, task: Some(task), _native: native }
	}

	fn spawn_poll(root: PathBuf, interval_seconds: u64, provider: SnapshotProvider) -> Self {
		let notify_signal = Arc::new(Notify::new());
		let recheck = Arc::new(Mutex::new(RecheckPaths::new(0)));
		let shutdown = Arc::new(AtomicBool::new(false));
		let native = Arc::new(Mutex::new(None));

		let notify_for_task = notify_signal.clone();
		let shutdown_for_task = shutdown.clone();
		let interval = Duration::from_secs(interval_seconds.max(1));
		let task = tokio::spawn(async move {
			let mut previous: Snapshot = None;
			loop {
				tokio::time::sleep(interval).await;
				if shutdown_for_task.load(Ordering::Acquire) {
					break;
				}
				let current = provider().await;
				if !crate::entry::Entry::subtree_eq(&previous, &current) {
					debug!("poll watcher observed a change under {}", root.display());
					notify_for_task.notify_one();
				}
				previous = current;
			}
		});

		Self { notify_signal, recheck, shutdown, task: Some(task), _native: native }
	}

	/// Resolves once after the next coalesced modification is observed.
	pub async fn notified(&self) {
		self.notify_signal.notified().await;
	}

	/// Drains the accumulated recheck set. `true` means the set overflowed
	/// and the caller should do a full warm scan instead of an
	/// accelerated one.
	pub fn take_recheck_paths(&self) -> (Vec<String>, bool) {
		self.recheck.lock().unwrap().take()
	}

	pub fn shutdown(&mut self) {
		self.shutdown.store(true, Ordering::Release);
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

impl Drop for Watcher {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// Open a recursive native watch feeding the shared recheck set and dirty
/// flag. Returns `None` when the watch cannot be established (commonly
/// because the root does not exist yet); callers retry on a timer.
fn establish_watch(
	root: &PathBuf,
	recheck: Arc<Mutex<RecheckPaths>>,
	dirty: Arc<AtomicBool>,
) -> Option<RecommendedWatcher> {
	let root_for_events = root.clone();
	let handler = move |res: notify::Result<Event>| {
		let event = match res {
			Ok(event) => event,
			Err(e) => {
				warn!("filesystem watch error on {}: {}", root_for_events.display(), e);
				return;
			}
		};
		let mut observed = false;
		let mut guard = recheck.lock().unwrap();
		for path in event.paths {
			if let Ok(relative) = path.strip_prefix(&root_for_events) {
				if let Some(s) = relative.to_str() {
					// The scanner's own filesystem probes churn at the root
					// on every scan; reacting to them would ping-pong the
					// controller into a scan loop.
					if s.contains("mutagen-probe-") {
						continue;
					}
					guard.insert(s.to_string());
					observed = true;
				}
			}
		}
		drop(guard);
		if observed {
			dirty.store(true, Ordering::Release);
		}
	};

	match RecommendedWatcher::new(handler, notify::Config::default()) {
		Ok(mut watcher) => match watcher.watch(root, RecursiveMode::Recursive) {
			Ok(()) => Some(watcher),
			Err(e) => {
				debug!("recursive watch on {} not established: {}", root.display(), e);
				None
			}
		},
		Err(e) => {
			warn!("failed to construct filesystem watcher: {}", e);
			None
		}
	}
}


// vim: ts=4
