//! Applies reconciled changes to a live filesystem: staged rename-into-
//! place, directory/symlink creation, and portable permission propagation.
//! Application is recursive: a change whose new entry is a directory
//! subtree materializes every descendant, and removed children are deleted
//! child-wise.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs as afs;
use tracing::debug;

use crate::cache::Cache;
use crate::config::{PermissionMode, SymlinkMode};
use crate::entry::{Entry, Snapshot};
use crate::error::TransitionError;
use crate::reconciler::Change;
use crate::scanner::Problem;
use crate::stager::Stager;
use crate::util::resolve_under_root;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResult {
	pub path: String,
	/// The entry actually present at `path` after the attempt; equals the
	/// change's new entry on full success and its old entry on a skip.
	pub entry: Snapshot,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TransitionOutcome {
	pub results: Vec<TransitionResult>,
	pub problems: Vec<Problem>,
	pub stager_missing_files: bool,
	pub made_changes: bool,
}

struct ApplyContext<'a> {
	stager: &'a Stager,
	symlink_mode: SymlinkMode,
	permission_mode: PermissionMode,
	default_file_mode: u32,
	default_directory_mode: u32,
	problems: Vec<Problem>,
	stager_missing_files: bool,
	made_changes: bool,
}

pub async fn apply_transition(
	root: &Path,
	changes: &[Change],
	stager: &Stager,
	cache: &Cache,
	symlink_mode: SymlinkMode,
	permission_mode: PermissionMode,
	default_file_mode: u32,
	default_directory_mode: u32,
) -> TransitionOutcome {
	let mut ctx = ApplyContext {
		stager,
		symlink_mode,
		permission_mode,
		default_file_mode,
		default_directory_mode,
		problems: Vec::new(),
		stager_missing_files: false,
		made_changes: false,
	};
	let mut results = Vec::new();

	for change in changes {
		let destination = match resolve_under_root(root, &change.path) {
			Some(p) => p,
			None => {
				ctx.problems.push(Problem { path: change.path.clone(), message: "path escapes synchronization root".to_string() });
				results.push(TransitionResult { path: change.path.clone(), entry: change.old.clone() });
				continue;
			}
		};

		if let Err(e) = verify_precondition(&destination, cache, &change.path, &change.old).await {
			ctx.problems.push(Problem { path: change.path.clone(), message: e.to_string() });
			results.push(TransitionResult { path: change.path.clone(), entry: change.old.clone() });
			continue;
		}

		debug!("transitioning {}", change.path);
		let achieved = apply_entry(&destination, &change.path, &change.old, &change.new, &mut ctx).await;
		results.push(TransitionResult { path: change.path.clone(), entry: achieved });
	}

	TransitionOutcome {
		results,
		problems: ctx.problems,
		stager_missing_files: ctx.stager_missing_files,
		made_changes: ctx.made_changes,
	}
}

/// Check that `destination`'s on-disk kind still matches what the change
/// expected, using a fresh stat corroborated against the cache's
/// last-observed identity. A mismatch means the filesystem moved underfoot
/// since the scan, and the change is skipped rather than applied blind.
async fn verify_precondition(destination: &Path, cache: &Cache, path: &str, old: &Snapshot) -> Result<(), TransitionError> {
	let live = afs::symlink_metadata(destination).await.ok();
	match (old.as_deref(), live) {
		(None, None) => Ok(()),
		(None, Some(_)) => Err(TransitionError::PreconditionMismatch { path: path.to_string() }),
		(Some(Entry::Directory { .. }), Some(meta)) if meta.is_dir() => Ok(()),
		(Some(Entry::Symlink { .. }), Some(meta)) if meta.file_type().is_symlink() => Ok(()),
		(Some(Entry::File { .. }), Some(meta)) if meta.is_file() => {
			// A cache miss isn't itself a mismatch since the entry may never
			// have made it into the cache (e.g. freshly staged); a size drift
			// since the scan is.
			match cache.get(path) {
				Some(cached) if cached.size != meta.len() => {
					Err(TransitionError::PreconditionMismatch { path: path.to_string() })
				}
				_ => Ok(()),
			}
		}
		(Some(Entry::Untracked), _) | (Some(Entry::Problem { .. }), _) => Ok(()),
		_ => Err(TransitionError::PreconditionMismatch { path: path.to_string() }),
	}
}

type BoxedApply<'a> = Pin<Box<dyn Future<Output = Snapshot> + Send + 'a>>;

/// Drive `destination` from `old` to `new`, returning the entry actually
/// achieved. Problems are recorded rather than propagated so one failing
/// descendant never aborts its siblings.
fn apply_entry<'a>(
	destination: &'a Path,
	rel_path: &'a str,
	old: &'a Snapshot,
	new: &'a Snapshot,
	ctx: &'a mut ApplyContext<'_>,
) -> BoxedApply<'a> {
	Box::pin(async move {
		if Entry::subtree_eq(old, new) {
			return new.clone();
		}

		match new.as_deref() {
			None => match remove_existing(destination).await {
				Ok(removed) => {
					ctx.made_changes |= removed;
					None
				}
				Err(e) => {
					ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
					old.clone()
				}
			},
			Some(Entry::Directory { contents }) => apply_directory(destination, rel_path, old, contents, ctx).await,
			Some(Entry::File { executable, digest }) => {
				match place_file(destination, rel_path, *executable, digest, ctx).await {
					Ok(()) => {
						ctx.made_changes = true;
						new.clone()
					}
					Err(PlaceError::ContentMissing) => {
						ctx.stager_missing_files = true;
						ctx.problems.push(Problem { path: rel_path.to_string(), message: "staged content not found".to_string() });
						old.clone()
					}
					Err(PlaceError::Io(e)) => {
						ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
						old.clone()
					}
				}
			}
			Some(Entry::Symlink { target }) => {
				if ctx.symlink_mode == SymlinkMode::Ignore {
					return old.clone();
				}
				// The scanner validates on the way in, but the change may
				// come from a peer with a different mode; never create a
				// link this side's mode would refuse to scan.
				if let Err(message) = ctx.symlink_mode.validate_target(rel_path, target) {
					ctx.problems.push(Problem { path: rel_path.to_string(), message });
					return old.clone();
				}
				match place_symlink(destination, target).await {
					Ok(()) => {
						ctx.made_changes = true;
						new.clone()
					}
					Err(e) => {
						ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
						old.clone()
					}
				}
			}
			// Untracked and problem placeholders have no content to
			// materialize; refusing keeps the ancestor honest about them.
			Some(Entry::Untracked) | Some(Entry::Problem { .. }) => {
				ctx.problems.push(Problem { path: rel_path.to_string(), message: "cannot propagate untracked or unreadable content".to_string() });
				old.clone()
			}
		}
	})
}

/// Ensure a directory exists at `destination`, then reconcile its children
/// against `new_contents` one name at a time. Returns the directory entry
/// actually achieved (children that failed keep their old entry).
async fn apply_directory(
	destination: &Path,
	rel_path: &str,
	old: &Snapshot,
	new_contents: &std::collections::BTreeMap<String, Arc<Entry>>,
	ctx: &mut ApplyContext<'_>,
) -> Snapshot {
	let old_contents = match old.as_deref() {
		Some(Entry::Directory { contents }) => contents.clone(),
		_ => {
			// Type change or fresh creation: clear whatever occupies the
			// path and start from an empty directory.
			if let Err(e) = clear_conflicting(destination).await {
				ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
				return old.clone();
			}
			std::collections::BTreeMap::new()
		}
	};

	let already_dir = matches!(afs::metadata(destination).await, Ok(meta) if meta.is_dir());
	if !already_dir {
		if let Err(e) = afs::create_dir_all(destination).await {
			ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
			return old.clone();
		}
		if ctx.permission_mode == PermissionMode::Portable {
			if let Err(e) = set_mode(destination, ctx.default_directory_mode).await {
				// The directory itself landed; only its mode didn't.
				ctx.problems.push(Problem { path: rel_path.to_string(), message: e.to_string() });
			}
		}
		ctx.made_changes = true;
	}

	let mut names: std::collections::BTreeSet<&String> = old_contents.keys().collect();
	names.extend(new_contents.keys());

	let mut achieved = std::collections::BTreeMap::new();
	for name in names {
		let child_old: Snapshot = old_contents.get(name).cloned();
		let child_new: Snapshot = new_contents.get(name).cloned();
		let child_path = if rel_path.is_empty() { name.clone() } else { format!("{}/{}", rel_path, name) };
		let child_dest = destination.join(name);
		if let Some(entry) = apply_entry(&child_dest, &child_path, &child_old, &child_new, ctx).await {
			achieved.insert(name.clone(), entry);
		}
	}

	Some(Arc::new(Entry::Directory { contents: achieved }))
}

enum PlaceError {
	ContentMissing,
	Io(std::io::Error),
}

impl From<std::io::Error> for PlaceError {
	fn from(e: std::io::Error) -> Self {
		PlaceError::Io(e)
	}
}

async fn place_file(
	destination: &Path,
	rel_path: &str,
	executable: bool,
	digest: &[u8],
	ctx: &mut ApplyContext<'_>,
) -> Result<(), PlaceError> {
	let staged = ctx.stager.provide(rel_path, digest).await.map_err(|_| PlaceError::ContentMissing)?;
	clear_conflicting(destination).await?;
	if let Some(parent) = destination.parent() {
		afs::create_dir_all(parent).await?;
	}
	afs::rename(&staged, destination).await?;
	if ctx.permission_mode == PermissionMode::Portable {
		let mode = if executable { ctx.default_file_mode | 0o111 } else { ctx.default_file_mode };
		set_mode(destination, mode).await?;
	} else if executable {
		set_mode(destination, 0o755).await?;
	}
	Ok(())
}

async fn place_symlink(destination: &Path, target: &str) -> Result<(), std::io::Error> {
	clear_conflicting(destination).await?;
	if let Some(parent) = destination.parent() {
		afs::create_dir_all(parent).await?;
	}
	afs::symlink(target, destination).await
}

async fn remove_existing(destination: &Path) -> Result<bool, std::io::Error> {
	match afs::symlink_metadata(destination).await {
		Ok(meta) if meta.is_dir() => {
			afs::remove_dir_all(destination).await?;
			Ok(true)
		}
		Ok(_) => {
			afs::remove_file(destination).await?;
			Ok(true)
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
		Err(e) => Err(e),
	}
}

/// Removes whatever currently occupies `destination` so a create can take
/// its place (a type change, e.g. file -> directory, leaves stale content
/// otherwise).
async fn clear_conflicting(destination: &Path) -> Result<(), std::io::Error> {
	match afs::symlink_metadata(destination).await {
		Ok(meta) if meta.is_dir() => afs::remove_dir_all(destination).await,
		Ok(_) => afs::remove_file(destination).await,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e),
	}
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), std::io::Error> {
	afs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}


// vim: ts=4
