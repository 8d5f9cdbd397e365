//! Session configuration.
//!
//! `SessionConfiguration` is the in-core configuration type carried by
//! `Session.configuration`. Parsing it from a file or CLI flags belongs to
//! the daemon/CLI layer — it is constructed programmatically here, though
//! it round-trips through the persisted session record via serde.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use crate::hash::HashAlgorithm;

/// The four synchronization modes the reconciler dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SynchronizationMode {
	/// Both sides' changes are preserved; conflicts are never
	/// auto-resolved.
	#[default]
	TwoWaySafe,
	/// Non-deletion wins over deletion; otherwise conflict.
	TwoWayResolved,
	/// Alpha wins unless it would silently overwrite a beta change.
	OneWaySafe,
	/// Alpha always wins; beta is forced to match, no conflicts produced.
	OneWayReplica,
}

impl SynchronizationMode {
	/// `true` for modes where synchronization never writes to alpha, i.e.
	/// the endpoint subsystem must refuse `stage`/`transition` there.
	pub fn alpha_is_read_only(self) -> bool {
		matches!(self, SynchronizationMode::OneWaySafe | SynchronizationMode::OneWayReplica)
	}
}

/// How symlinks are represented across sides. Ignore drops them from the
/// tree entirely; portable admits only relative targets that resolve
/// inside the synchronization root, so a link means the same thing on
/// both sides; raw propagates whatever the platform stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkMode {
	Ignore,
	#[default]
	Portable,
	Raw,
}

impl SymlinkMode {
	/// Validate `target` for a symlink at root-relative `path`, per this
	/// mode. Both the scanner (before admitting a link into a snapshot)
	/// and the transitioner (before creating one) consult this, so an
	/// invalid target can never cross sides.
	pub fn validate_target(self, path: &str, target: &str) -> Result<(), String> {
		match self {
			SymlinkMode::Ignore | SymlinkMode::Raw => Ok(()),
			SymlinkMode::Portable => {
				if target.is_empty() {
					return Err("empty symlink target".to_string());
				}
				if target.contains('\0') {
					return Err("symlink target contains a NUL byte".to_string());
				}
				if target.starts_with('/') {
					return Err(format!("absolute symlink target: {}", target));
				}
				// Walk the target from the link's parent directory; dipping
				// below the root makes the link unportable.
				let mut depth = path.split('/').filter(|c| !c.is_empty()).count().saturating_sub(1);
				for component in target.split('/') {
					match component {
						"" | "." => {}
						".." => {
							if depth == 0 {
								return Err(format!("symlink target escapes the synchronization root: {}", target));
							}
							depth -= 1;
						}
						_ => depth += 1,
					}
				}
				Ok(())
			}
		}
	}
}

impl std::fmt::Display for SymlinkMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SymlinkMode::Ignore => write!(f, "ignore"),
			SymlinkMode::Portable => write!(f, "portable"),
			SymlinkMode::Raw => write!(f, "raw"),
		}
	}
}

/// Permission propagation mode. Full POSIX ACLs and xattrs are never
/// synchronized; portable mode additionally applies configured default
/// mode bits to created entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
	/// Propagate only entry type and executability.
	#[default]
	Ignore,
	/// Also propagate a configured default mode and owner/group.
	Portable,
}

/// Scan acceleration mode requested by the controller per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
	/// Prefer `baseline` + `recheckPaths` when available.
	#[default]
	Accelerated,
	/// Always perform a full warm scan.
	Full,
}

/// Watcher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
	Disabled,
	#[default]
	Recursive,
	Poll { interval_seconds: u64 },
}

/// Where the stager places its content-addressed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StagingMode {
	/// Inside the Mutagen data directory; never needs hiding.
	#[default]
	DataDir,
	/// A sibling of the synchronization root, hidden with a dot-prefix.
	Neighboring,
	/// Inside the root itself, hidden with a dot-prefix.
	Internal,
}

impl StagingMode {
	/// `Neighboring` and `Internal` place the staging tree where a warm
	/// scan would otherwise see it, so it must be hidden.
	pub fn requires_hiding(self) -> bool {
		matches!(self, StagingMode::Neighboring | StagingMode::Internal)
	}
}

/// In-core configuration for a synchronization session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfiguration {
	pub synchronization_mode: SynchronizationMode,
	pub symlink_mode: SymlinkMode,
	pub permission_mode: PermissionMode,
	pub hash_algorithm: HashAlgorithm,
	pub staging_mode: StagingMode,
	pub scan_mode: ScanMode,
	pub watch_mode: WatchMode,
	/// Double-star glob ignore patterns.
	pub ignore_patterns: Vec<String>,
	/// Hard cap on the number of entries a single scan/stage may produce.
	pub max_entry_count: usize,
	/// Forbid a side from unilaterally emptying a previously non-empty
	/// root; the session halts instead of propagating the deletions.
	pub forbid_root_emptying: bool,
	/// Default mode bits applied to created files/directories when
	/// `permission_mode` is `Portable`.
	pub default_file_mode: u32,
	pub default_directory_mode: u32,
}

impl Default for SessionConfiguration {
	fn default() -> Self {
		SessionConfiguration {
			synchronization_mode: SynchronizationMode::default(),
			symlink_mode: SymlinkMode::default(),
			permission_mode: PermissionMode::default(),
			hash_algorithm: HashAlgorithm::default(),
			staging_mode: StagingMode::default(),
			scan_mode: ScanMode::default(),
			watch_mode: WatchMode::default(),
			ignore_patterns: Vec::new(),
			max_entry_count: 1_000_000,
			forbid_root_emptying: true,
			default_file_mode: 0o644,
			default_directory_mode: 0o755,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_mode_is_two_way_safe() {
		let cfg = SessionConfiguration::default();
		assert_eq!(cfg.synchronization_mode, SynchronizationMode::TwoWaySafe);
		assert!(!cfg.synchronization_mode.alpha_is_read_only());
	}

	#[test]
	fn one_way_modes_make_alpha_read_only() {
		assert!(SynchronizationMode::OneWaySafe.alpha_is_read_only());
		assert!(SynchronizationMode::OneWayReplica.alpha_is_read_only());
		assert!(!SynchronizationMode::TwoWayResolved.alpha_is_read_only());
	}

	#[test]
	fn portable_symlink_targets_stay_inside_the_root() {
		let mode = SymlinkMode::Portable;
		assert!(mode.validate_target("link", "file.txt").is_ok());
		assert!(mode.validate_target("dir/link", "../file.txt").is_ok());
		assert!(mode.validate_target("dir/link", "./sub/file.txt").is_ok());
		assert!(mode.validate_target("dir/link", "sub/../file.txt").is_ok());

		assert!(mode.validate_target("link", "/etc/passwd").is_err());
		assert!(mode.validate_target("link", "../outside").is_err());
		assert!(mode.validate_target("dir/link", "../../outside").is_err());
		assert!(mode.validate_target("link", "a/../../outside").is_err());
		assert!(mode.validate_target("link", "").is_err());
	}

	#[test]
	fn raw_symlink_targets_are_unrestricted() {
		assert!(SymlinkMode::Raw.validate_target("link", "/etc/passwd").is_ok());
		assert!(SymlinkMode::Raw.validate_target("link", "../../anywhere").is_ok());
	}

	#[test]
	fn staging_mode_hiding_rule() {
		assert!(!StagingMode::DataDir.requires_hiding());
		assert!(StagingMode::Neighboring.requires_hiding());
		assert!(StagingMode::Internal.requires_hiding());
	}

	#[test]
	fn round_trips_through_json() {
		let cfg = SessionConfiguration::default();
		let json = serde_json::to_string(&cfg).unwrap();
		let back: SessionConfiguration = serde_json::from_str(&json).unwrap();
		assert_eq!(back.synchronization_mode, cfg.synchronization_mode);
	}
}

// vim: ts=4
