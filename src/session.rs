//! Session records and their on-disk layout: the persisted `Session`
//! (configuration + URLs + labels), the runtime-only `SessionState` the
//! controller publishes, and the ancestor archive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{SessionConfiguration, StagingMode};
use crate::entry::Snapshot;
use crate::error::PersistenceError;
use crate::reconciler::Conflict;
use crate::scanner::Problem;
use crate::util::write_atomic;

/// Version tag stamped into each persisted session record so a future
/// release can migrate or refuse records it does not understand.
pub const SESSION_VERSION: u32 = 1;

/// A synchronization session as persisted: everything needed to resume it
/// after a daemon restart. Runtime status lives in `SessionState` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
	pub identifier: String,
	pub version: u32,
	pub alpha_url: String,
	pub beta_url: String,
	pub configuration: SessionConfiguration,
	/// Free-form identification labels, stored for the CLI's benefit; the
	/// core never interprets them.
	pub labels: BTreeMap<String, String>,
	pub paused: bool,
}

impl Session {
	pub fn new(alpha_url: String, beta_url: String, configuration: SessionConfiguration, labels: BTreeMap<String, String>) -> Self {
		Session {
			identifier: uuid::Uuid::new_v4().to_string(),
			version: SESSION_VERSION,
			alpha_url,
			beta_url,
			configuration,
			labels,
			paused: false,
		}
	}
}

/// Where the controller is in its cycle. The three halt variants are
/// terminal until the user resumes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
	#[default]
	Disconnected,
	ConnectingAlpha,
	ConnectingBeta,
	Watching,
	Scanning,
	WaitingForRescan,
	Reconciling,
	StagingAlpha,
	StagingBeta,
	Transitioning,
	Saving,
	HaltedOnRootDeletion,
	HaltedOnRootEmptied,
	HaltedOnRootTypeChange,
}

impl SessionStatus {
	pub fn is_halted(self) -> bool {
		matches!(
			self,
			SessionStatus::HaltedOnRootDeletion | SessionStatus::HaltedOnRootEmptied | SessionStatus::HaltedOnRootTypeChange
		)
	}
}

/// Runtime-only session state, published by the controller after every
/// status change and observable through `ControllerHandle::state`.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
	pub status: SessionStatus,
	pub alpha_connected: bool,
	pub beta_connected: bool,
	pub last_error: Option<String>,
	pub successful_cycles: u64,
	pub conflicts: Vec<Conflict>,
	pub alpha_problems: Vec<Problem>,
	pub beta_problems: Vec<Problem>,
	/// Set when the last transition reported missing staged content; the
	/// next cycle re-stages those paths.
	pub staging_retry_needed: bool,
}

/// The per-user data directory layout: sessions, archives, and caches each
/// live in their own subdirectory, keyed by session identifier.
#[derive(Debug, Clone)]
pub struct DataDirectory {
	root: PathBuf,
}

impl DataDirectory {
	pub fn new(root: PathBuf) -> Self {
		DataDirectory { root }
	}

	pub fn session_path(&self, identifier: &str) -> PathBuf {
		self.root.join("synchronization").join("sessions").join(identifier)
	}

	pub fn archive_path(&self, identifier: &str) -> PathBuf {
		self.root.join("synchronization").join("archives").join(identifier)
	}

	pub fn cache_path(&self, identifier: &str, alpha: bool) -> PathBuf {
		let side = if alpha { "alpha" } else { "beta" };
		self.root.join("synchronization").join("caches").join(format!("{}_{}", identifier, side))
	}

	/// Staging roots sit beside the caches so `wipe()` never touches
	/// another session's content.
	pub fn staging_path(&self, identifier: &str, alpha: bool) -> PathBuf {
		let side = if alpha { "alpha" } else { "beta" };
		self.root.join("synchronization").join("staging").join(format!("{}_{}", identifier, side))
	}

	/// Resolve the staging root for one side per the session's staging
	/// mode. Neighboring and internal placements are dot-prefixed and carry
	/// the `.mutagen-staging` suffix the scanner always ignores, so a warm
	/// scan never sees its own staging tree.
	pub fn resolve_staging_root(&self, mode: StagingMode, identifier: &str, alpha: bool, sync_root: &Path) -> PathBuf {
		let side = if alpha { "alpha" } else { "beta" };
		match mode {
			StagingMode::DataDir => self.staging_path(identifier, alpha),
			StagingMode::Neighboring => {
				let name = format!(".{}-{}.mutagen-staging", identifier, side);
				sync_root.parent().unwrap_or(sync_root).join(name)
			}
			StagingMode::Internal => sync_root.join(format!(".{}-{}.mutagen-staging", identifier, side)),
		}
	}

	pub async fn save_session(&self, session: &Session) -> Result<(), PersistenceError> {
		let path = self.session_path(&session.identifier);
		let bytes = bincode::serialize(session)
			.map_err(|e| PersistenceError::Corrupted { path: path.display().to_string(), message: e.to_string() })?;
		write_atomic(&path, &bytes).await
	}

	pub async fn load_session(&self, identifier: &str) -> Result<Session, PersistenceError> {
		let path = self.session_path(identifier);
		let bytes = tokio::fs::read(&path)
			.await
			.map_err(|source| PersistenceError::Io { path: path.display().to_string(), source })?;
		bincode::deserialize(&bytes)
			.map_err(|e| PersistenceError::Corrupted { path: path.display().to_string(), message: e.to_string() })
	}

	/// Persist the ancestor snapshot. Atomic, so a reader (or a crashed
	/// cycle) sees either the pre- or post-cycle archive, never a partial
	/// one.
	pub async fn save_archive(&self, identifier: &str, ancestor: &Snapshot) -> Result<(), PersistenceError> {
		let path = self.archive_path(identifier);
		let bytes = bincode::serialize(ancestor)
			.map_err(|e| PersistenceError::Corrupted { path: path.display().to_string(), message: e.to_string() })?;
		write_atomic(&path, &bytes).await
	}

	/// Load the ancestor snapshot, or a nil root when no archive has been
	/// written yet (a brand-new session).
	pub async fn load_archive(&self, identifier: &str) -> Result<Snapshot, PersistenceError> {
		let path = self.archive_path(identifier);
		let bytes = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(source) => return Err(PersistenceError::Io { path: path.display().to_string(), source }),
		};
		bincode::deserialize(&bytes)
			.map_err(|e| PersistenceError::Corrupted { path: path.display().to_string(), message: e.to_string() })
	}

	pub async fn delete_session(&self, identifier: &str) -> Result<(), PersistenceError> {
		for path in [self.session_path(identifier), self.archive_path(identifier)] {
			match tokio::fs::remove_file(&path).await {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(source) => return Err(PersistenceError::Io { path: path.display().to_string(), source }),
			}
		}
		Ok(())
	}

	/// Acquire an exclusive advisory lock for this session. Refuses if a
	/// live lock file already exists.
	pub async fn lock_session(&self, identifier: &str) -> Result<SessionLock, PersistenceError> {
		let path = self.session_path(identifier).with_extension("lock");
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|source| PersistenceError::Io { path: path.display().to_string(), source })?;
		}
		if tokio::fs::metadata(&path).await.is_ok() {
			return Err(PersistenceError::Corrupted {
				path: path.display().to_string(),
				message: "session is already locked (delete the lock file if stale)".to_string(),
			});
		}
		tokio::fs::write(&path, std::process::id().to_string())
			.await
			.map_err(|source| PersistenceError::Io { path: path.display().to_string(), source })?;
		Ok(SessionLock { path })
	}
}

/// RAII guard for exclusive session access; removes the lock file on drop.
pub struct SessionLock {
	path: PathBuf,
}

impl SessionLock {
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for SessionLock {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn sample_session() -> Session {
		Session::new(
			"/tmp/alpha".to_string(),
			"/tmp/beta".to_string(),
			SessionConfiguration::default(),
			BTreeMap::new(),
		)
	}

	#[tokio::test]
	async fn session_record_round_trips() {
		let dir = tempdir().unwrap();
		let data = DataDirectory::new(dir.path().to_path_buf());
		let session = sample_session();
		data.save_session(&session).await.unwrap();

		let loaded = data.load_session(&session.identifier).await.unwrap();
		assert_eq!(loaded.identifier, session.identifier);
		assert_eq!(loaded.alpha_url, "/tmp/alpha");
		assert_eq!(loaded.version, SESSION_VERSION);
	}

	#[tokio::test]
	async fn missing_archive_is_a_nil_root() {
		let dir = tempdir().unwrap();
		let data = DataDirectory::new(dir.path().to_path_buf());
		let ancestor = data.load_archive("no-such-session").await.unwrap();
		assert!(ancestor.is_none());
	}

	#[tokio::test]
	async fn archive_round_trips() {
		use crate::entry::Entry;
		use std::sync::Arc;

		let dir = tempdir().unwrap();
		let data = DataDirectory::new(dir.path().to_path_buf());
		let ancestor: Snapshot = Some(Arc::new(Entry::File { executable: false, digest: vec![1, 2, 3] }));
		data.save_archive("s1", &ancestor).await.unwrap();
		let loaded = data.load_archive("s1").await.unwrap();
		assert_eq!(loaded, ancestor);
	}

	#[tokio::test]
	async fn second_lock_is_refused_until_the_first_drops() {
		let dir = tempdir().unwrap();
		let data = DataDirectory::new(dir.path().to_path_buf());
		let lock = data.lock_session("s1").await.unwrap();
		assert!(data.lock_session("s1").await.is_err());
		drop(lock);
		let relock = data.lock_session("s1").await.unwrap();
		drop(relock);
	}

	#[test]
	fn per_session_paths_are_disjoint_per_side() {
		let data = DataDirectory::new(PathBuf::from("/data"));
		assert_ne!(data.cache_path("s", true), data.cache_path("s", false));
		assert_ne!(data.staging_path("s", true), data.staging_path("s", false));
		assert_ne!(data.session_path("s"), data.archive_path("s"));
	}

	#[test]
	fn staging_roots_follow_the_configured_placement() {
		let data = DataDirectory::new(PathBuf::from("/data"));
		let sync_root = Path::new("/home/me/project");

		let in_data = data.resolve_staging_root(StagingMode::DataDir, "s", true, sync_root);
		assert!(in_data.starts_with("/data"));

		let neighboring = data.resolve_staging_root(StagingMode::Neighboring, "s", true, sync_root);
		assert_eq!(neighboring.parent(), Some(Path::new("/home/me")));

		let internal = data.resolve_staging_root(StagingMode::Internal, "s", false, sync_root);
		assert!(internal.starts_with(sync_root));

		// Hidden placements are dot-prefixed and carry the suffix the
		// scanner's built-in ignores match.
		for hidden in [&neighboring, &internal] {
			let name = hidden.file_name().unwrap().to_str().unwrap();
			assert!(name.starts_with('.'));
			assert!(name.ends_with(".mutagen-staging"));
		}
	}
}

// vim: ts=4
