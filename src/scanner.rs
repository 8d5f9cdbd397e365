//! Filesystem scanning: produces an immutable `Snapshot` from a live root,
//! either by a full warm traversal or by re-scanning only the paths a
//! watcher flagged as changed.

use std::collections::BTreeMap;
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use crate::cache::{Cache, CacheEntry, IgnoreCache};
use crate::config::SymlinkMode;
use crate::entry::{normalize_name, Entry, Snapshot};
use crate::error::ScanError;
use crate::exclusion::ExclusionEngine;
use crate::hash::HashAlgorithm;

/// A non-fatal issue recorded at a path during scan, stage, or transition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Problem {
	pub path: String,
	pub message: String,
}

/// Result of a single scan invocation.
pub struct ScanOutcome {
	pub snapshot: Snapshot,
	pub preserves_executability: bool,
	pub decomposes_unicode: bool,
	pub problems: Vec<Problem>,
}

/// Scan `root` from scratch, consulting `cache`/`ignore_cache` for
/// unchanged files and updating both in place.
pub async fn scan_warm(
	root: &Path,
	cache: &mut Cache,
	ignore_cache: &mut IgnoreCache,
	ignores: &ExclusionEngine,
	hash_algorithm: HashAlgorithm,
	symlink_mode: SymlinkMode,
) -> Result<ScanOutcome, ScanError> {
	let metadata = tokio::fs::symlink_metadata(root).await;
	let root_exists = match metadata {
		Ok(m) => m.is_dir(),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
		Err(e) => return Err(ScanError::RootUnreadable { path: root.display().to_string(), source: e }),
	};

	if !root_exists {
		return Ok(ScanOutcome {
			snapshot: None,
			preserves_executability: true,
			decomposes_unicode: false,
			problems: Vec::new(),
		});
	}

	let (preserves_executability, decomposes_unicode) = probe_filesystem(root).await;

	let mut problems = Vec::new();
	let entry = scan_directory(
		root,
		"",
		cache,
		ignore_cache,
		ignores,
		hash_algorithm,
		symlink_mode,
		&mut problems,
	)
	.await?;

	Ok(ScanOutcome {
		snapshot: Some(Arc::new(entry)),
		preserves_executability,
		decomposes_unicode,
		problems,
	})
}

/// Re-scan only `recheck_paths` and their subtrees against `baseline`,
/// replacing the corresponding spines copy-on-write; all other subtrees
/// come from `baseline` untouched, without any I/O.
pub async fn scan_accelerated(
	root: &Path,
	baseline: &Snapshot,
	recheck_paths: &[String],
	cache: &mut Cache,
	ignore_cache: &mut IgnoreCache,
	ignores: &ExclusionEngine,
	hash_algorithm: HashAlgorithm,
	symlink_mode: SymlinkMode,
) -> Result<ScanOutcome, ScanError> {
	let mut snapshot = baseline.clone();
	let mut problems = Vec::new();
	let (preserves_executability, decomposes_unicode) = probe_filesystem(root).await;

	for recheck in recheck_paths {
		let full_path = root.join(recheck);
		let sub_exists = tokio::fs::symlink_metadata(&full_path).await.is_ok();

		let replacement = if sub_exists {
			let metadata = tokio::fs::symlink_metadata(&full_path)
				.await
				.map_err(|e| ScanError::Transient { path: recheck.clone(), source: e })?;
			if metadata.is_dir() {
				let entry = Box::pin(scan_directory(
					&full_path,
					recheck,
					cache,
					ignore_cache,
					ignores,
					hash_algorithm,
					symlink_mode,
					&mut problems,
				))
				.await?;
				Some(Arc::new(entry))
			} else {
				match scan_leaf(&full_path, recheck, cache, hash_algorithm, symlink_mode).await {
					Ok(Some(entry)) => Some(Arc::new(entry)),
					Ok(None) => None,
					Err(e @ ScanError::Transient { .. }) => return Err(e),
					Err(e) => {
						let message = e.to_string();
						problems.push(Problem { path: recheck.clone(), message: message.clone() });
						Some(Arc::new(Entry::Problem { message }))
					}
				}
			}
		} else {
			None
		};

		snapshot = crate::entry::replace_at(&snapshot, recheck, replacement);
	}

	Ok(ScanOutcome { snapshot, preserves_executability, decomposes_unicode, problems })
}

/// Races with concurrent modification are retryable; everything else
/// becomes a problem entry.
fn classify_io(path: &str, e: std::io::Error) -> ScanError {
	match e.kind() {
		std::io::ErrorKind::NotFound | std::io::ErrorKind::Interrupted => {
			ScanError::Transient { path: path.to_string(), source: e }
		}
		_ => ScanError::Permanent { path: path.to_string(), message: e.to_string() },
	}
}

type BoxedScan<'a> = Pin<Box<dyn Future<Output = Result<Entry, ScanError>> + Send + 'a>>;

fn scan_directory<'a>(
	dir: &'a Path,
	rel_path: &'a str,
	cache: &'a mut Cache,
	ignore_cache: &'a mut IgnoreCache,
	ignores: &'a ExclusionEngine,
	hash_algorithm: HashAlgorithm,
	symlink_mode: SymlinkMode,
	problems: &'a mut Vec<Problem>,
) -> BoxedScan<'a> {
	Box::pin(async move {
		let mut read_dir = tokio::fs::read_dir(dir)
			.await
			.map_err(|e| ScanError::Transient { path: rel_path.to_string(), source: e })?;

		let mut contents = BTreeMap::new();

		loop {
			let entry = match read_dir.next_entry().await {
				Ok(Some(e)) => e,
				Ok(None) => break,
				Err(e) => return Err(ScanError::Transient { path: rel_path.to_string(), source: e }),
			};

			let raw_name = entry.file_name();
			let raw_name = match raw_name.to_str() {
				Some(s) => s,
				None => {
					problems.push(Problem {
						path: rel_path.to_string(),
						message: "non-UTF8 filename".to_string(),
					});
					continue;
				}
			};
			let name = match normalize_name(raw_name) {
				Some(n) => n,
				None => {
					problems.push(Problem {
						path: format!("{}/{}", rel_path, raw_name),
						message: "invalid entry name".to_string(),
					});
					continue;
				}
			};

			let child_rel = if rel_path.is_empty() { name.clone() } else { format!("{}/{}", rel_path, name) };
			let child_path = entry.path();

			let is_dir_guess = entry
				.file_type()
				.await
				.map(|t| t.is_dir() && !t.is_symlink())
				.unwrap_or(false);

			if let Some(excluded) = ignore_cache.get(&child_rel, is_dir_guess) {
				if excluded {
					continue;
				}
			} else {
				let excluded = ignores.is_excluded(Path::new(&child_rel));
				ignore_cache.set(&child_rel, is_dir_guess, excluded);
				if excluded {
					continue;
				}
			}

			if is_dir_guess {
				match scan_directory(
					&child_path,
					&child_rel,
					cache,
					ignore_cache,
					ignores,
					hash_algorithm,
					symlink_mode,
					problems,
				)
				.await
				{
					Ok(sub) => {
						contents.insert(name, Arc::new(sub));
					}
					Err(e @ ScanError::Transient { .. }) => return Err(e),
					// Permanent per-path failures become problem entries so
					// the tree records the path without its content.
					Err(e) => {
						contents.insert(name, Arc::new(Entry::Problem { message: e.to_string() }));
						problems.push(Problem { path: child_rel, message: e.to_string() });
					}
				}
			} else {
				match scan_leaf(&child_path, &child_rel, cache, hash_algorithm, symlink_mode).await {
					Ok(Some(leaf)) => {
						contents.insert(name, Arc::new(leaf));
					}
					Ok(None) => {}
					Err(e @ ScanError::Transient { .. }) => return Err(e),
					Err(e) => {
						contents.insert(name, Arc::new(Entry::Problem { message: e.to_string() }));
						problems.push(Problem { path: child_rel, message: e.to_string() });
					}
				}
			}
		}

		Ok(Entry::Directory { contents })
	})
}

/// Scan a single non-directory path (file or symlink).
async fn scan_leaf(
	path: &Path,
	rel_path: &str,
	cache: &mut Cache,
	hash_algorithm: HashAlgorithm,
	symlink_mode: SymlinkMode,
) -> Result<Option<Entry>, ScanError> {
	let metadata = tokio::fs::symlink_metadata(path)
		.await
		.map_err(|e| classify_io(rel_path, e))?;

	if metadata.file_type().is_symlink() {
		if symlink_mode == SymlinkMode::Ignore {
			return Ok(None);
		}
		let target = tokio::fs::read_link(path)
			.await
			.map_err(|e| classify_io(rel_path, e))?;
		let target = target.to_string_lossy().into_owned();
		// Portable mode refuses targets that would mean something different
		// on the other side; the refusal becomes a problem entry.
		if let Err(message) = symlink_mode.validate_target(rel_path, &target) {
			return Err(ScanError::Permanent { path: rel_path.to_string(), message });
		}
		return Ok(Some(Entry::Symlink { target }));
	}

	if !metadata.is_file() {
		return Ok(Some(Entry::Untracked));
	}

	let observed = CacheEntry {
		mtime_seconds: metadata.mtime(),
		mtime_nanos: metadata.mtime_nsec() as u32,
		size: metadata.size(),
		mode: metadata.mode(),
		device: metadata.dev(),
		inode: metadata.ino(),
		digest: Vec::new(),
	};

	let digest = match cache.get(rel_path) {
		Some(cached) if cached.matches(&observed) => cached.digest,
		_ => {
			let bytes = tokio::fs::read(path)
				.await
				.map_err(|e| classify_io(rel_path, e))?;
			let digest = crate::hash::digest(hash_algorithm, &bytes);
			let mut entry = observed.clone();
			entry.digest = digest.clone();
			let _ = cache.set(rel_path, entry);
			digest
		}
	};

	let executable = metadata.mode() & 0o111 != 0;
	Ok(Some(Entry::File { executable, digest }))
}

/// Probe whether this filesystem preserves executability bits and whether
/// it decomposes Unicode names (NFD) or preserves the NFC form it was
/// given. Creates and removes two temporary files at the root.
async fn probe_filesystem(root: &Path) -> (bool, bool) {
	let exec_probe = root.join(format!(".mutagen-probe-exec-{}", std::process::id()));
	let preserves_executability = match tokio::fs::write(&exec_probe, b"").await {
		Ok(()) => {
			let result = set_executable(&exec_probe).await;
			let _ = tokio::fs::remove_file(&exec_probe).await;
			result
		}
		Err(_) => true,
	};

	// Write a probe whose name is NFC and see what form the filesystem
	// hands back from a directory listing.
	let probe_name = format!("mutagen-probe-\u{e9}{}", std::process::id());
	let probe_path = root.join(&probe_name);
	let decomposes_unicode = match tokio::fs::write(&probe_path, b"").await {
		Ok(()) => {
			let mut decomposes = false;
			if let Ok(mut read_dir) = tokio::fs::read_dir(root).await {
				while let Ok(Some(entry)) = read_dir.next_entry().await {
					if let Some(name) = entry.file_name().to_str() {
						if !name.starts_with("mutagen-probe-") {
							continue;
						}
						let normalized: String = name.nfc().collect();
						if normalized == probe_name {
							decomposes = name != probe_name;
						}
					}
				}
			}
			let _ = tokio::fs::remove_file(&probe_path).await;
			decomposes
		}
		Err(_) => false,
	};

	(preserves_executability, decomposes_unicode)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;
	if let Ok(metadata) = tokio::fs::metadata(path).await {
		let mut perms = metadata.permissions();
		perms.set_mode(0o755);
		if tokio::fs::set_permissions(path, perms).await.is_ok() {
			if let Ok(after) = tokio::fs::metadata(path).await {
				return after.permissions().mode() & 0o111 != 0;
			}
		}
	}
	true
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> bool {
	false
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SymlinkMode;

	fn test_ignores() -> ExclusionEngine {
		ExclusionEngine::new(&[]).unwrap()
	}

	#[tokio::test]
	async fn warm_scan_empty_root_is_empty_directory() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = Cache::open(&dir.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		let outcome = scan_warm(
			dir.path(),
			&mut cache,
			&mut ignore_cache,
			&test_ignores(),
			HashAlgorithm::Blake3,
			SymlinkMode::Portable,
		)
		.await
		.unwrap();
		match outcome.snapshot.as_deref() {
			Some(Entry::Directory { contents }) => assert!(contents.is_empty()),
			other => panic!("expected empty directory, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn warm_scan_missing_root_is_nil() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("does-not-exist");
		let mut cache = Cache::open(&dir.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		let outcome = scan_warm(
			&missing,
			&mut cache,
			&mut ignore_cache,
			&test_ignores(),
			HashAlgorithm::Blake3,
			SymlinkMode::Portable,
		)
		.await
		.unwrap();
		assert!(outcome.snapshot.is_none());
	}

	#[tokio::test]
	async fn warm_scan_finds_file_content() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.txt"), b"hello\n").await.unwrap();
		let mut cache = Cache::open(&dir.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		let outcome = scan_warm(
			dir.path(),
			&mut cache,
			&mut ignore_cache,
			&test_ignores(),
			HashAlgorithm::Blake3,
			SymlinkMode::Portable,
		)
		.await
		.unwrap();
		let root = outcome.snapshot.unwrap();
		let found = root.lookup("a.txt").unwrap();
		match found {
			Entry::File { digest, .. } => {
				assert_eq!(digest, &crate::hash::digest(HashAlgorithm::Blake3, b"hello\n"));
			}
			other => panic!("expected file, got {:?}", other),
		}
	}

	async fn scan_with_mode(root: &Path, symlink_mode: SymlinkMode) -> ScanOutcome {
		let data = tempfile::tempdir().unwrap();
		let mut cache = Cache::open(&data.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		scan_warm(root, &mut cache, &mut ignore_cache, &test_ignores(), HashAlgorithm::Blake3, symlink_mode)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn portable_mode_admits_relative_symlinks_inside_the_root() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("real.txt"), b"x").await.unwrap();
		tokio::fs::symlink("real.txt", dir.path().join("rel")).await.unwrap();

		let outcome = scan_with_mode(dir.path(), SymlinkMode::Portable).await;
		let root = outcome.snapshot.unwrap();
		assert!(matches!(root.lookup("rel"), Some(Entry::Symlink { target }) if target == "real.txt"));
		assert!(outcome.problems.is_empty());
	}

	#[tokio::test]
	async fn portable_mode_turns_escaping_symlinks_into_problem_entries() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::symlink("/etc/hostname", dir.path().join("abs")).await.unwrap();
		tokio::fs::symlink("../outside", dir.path().join("up")).await.unwrap();

		let outcome = scan_with_mode(dir.path(), SymlinkMode::Portable).await;
		let root = outcome.snapshot.unwrap();
		assert!(matches!(root.lookup("abs"), Some(Entry::Problem { .. })));
		assert!(matches!(root.lookup("up"), Some(Entry::Problem { .. })));
		assert_eq!(outcome.problems.len(), 2);
	}

	#[tokio::test]
	async fn raw_mode_admits_targets_verbatim() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::symlink("/etc/hostname", dir.path().join("abs")).await.unwrap();

		let outcome = scan_with_mode(dir.path(), SymlinkMode::Raw).await;
		let root = outcome.snapshot.unwrap();
		assert!(matches!(root.lookup("abs"), Some(Entry::Symlink { target }) if target == "/etc/hostname"));
		assert!(outcome.problems.is_empty());
	}

	#[tokio::test]
	async fn ignore_mode_leaves_symlinks_out_of_the_tree() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("real.txt"), b"x").await.unwrap();
		tokio::fs::symlink("real.txt", dir.path().join("rel")).await.unwrap();

		let outcome = scan_with_mode(dir.path(), SymlinkMode::Ignore).await;
		let root = outcome.snapshot.unwrap();
		assert!(root.lookup("rel").is_none());
		assert!(matches!(root.lookup("real.txt"), Some(Entry::File { .. })));
	}

	#[tokio::test]
	async fn unchanged_metadata_reuses_the_cached_digest() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.txt");
		tokio::fs::write(&path, b"first").await.unwrap();

		let mut cache = Cache::open(&dir.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		let first = scan_warm(dir.path(), &mut cache, &mut ignore_cache, &test_ignores(), HashAlgorithm::Blake3, SymlinkMode::Portable)
			.await
			.unwrap();
		let first_digest = match first.snapshot.as_deref().unwrap().lookup("a.txt").unwrap() {
			Entry::File { digest, .. } => digest.clone(),
			other => panic!("expected file, got {:?}", other),
		};

		// Same size, and the mtime pinned back to its pre-write value: the
		// scanner must trust the cache and return the stale digest.
		let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path).unwrap());
		tokio::fs::write(&path, b"xirst").await.unwrap();
		filetime::set_file_mtime(&path, mtime).unwrap();

		let second = scan_warm(dir.path(), &mut cache, &mut ignore_cache, &test_ignores(), HashAlgorithm::Blake3, SymlinkMode::Portable)
			.await
			.unwrap();
		match second.snapshot.as_deref().unwrap().lookup("a.txt").unwrap() {
			Entry::File { digest, .. } => assert_eq!(digest, &first_digest),
			other => panic!("expected file, got {:?}", other),
		}

		// Bumping the mtime invalidates the entry and forces a rehash.
		filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime.unix_seconds() + 5, 0)).unwrap();
		let third = scan_warm(dir.path(), &mut cache, &mut ignore_cache, &test_ignores(), HashAlgorithm::Blake3, SymlinkMode::Portable)
			.await
			.unwrap();
		match third.snapshot.as_deref().unwrap().lookup("a.txt").unwrap() {
			Entry::File { digest, .. } => {
				assert_eq!(digest, &crate::hash::digest(HashAlgorithm::Blake3, b"xirst"));
			}
			other => panic!("expected file, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn accelerated_scan_only_touches_recheck_paths() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir(dir.path().join("unchanged")).await.unwrap();
		tokio::fs::write(dir.path().join("unchanged/x.txt"), b"x").await.unwrap();
		tokio::fs::write(dir.path().join("changed.txt"), b"before").await.unwrap();

		let mut cache = Cache::open(&dir.path().join("cache.redb")).unwrap();
		let mut ignore_cache = IgnoreCache::new();
		let baseline = scan_warm(
			dir.path(),
			&mut cache,
			&mut ignore_cache,
			&test_ignores(),
			HashAlgorithm::Blake3,
			SymlinkMode::Portable,
		)
		.await
		.unwrap()
		.snapshot;

		tokio::fs::write(dir.path().join("changed.txt"), b"after").await.unwrap();

		let accelerated = scan_accelerated(
			dir.path(),
			&baseline,
			&["changed.txt".to_string()],
			&mut cache,
			&mut ignore_cache,
			&test_ignores(),
			HashAlgorithm::Blake3,
			SymlinkMode::Portable,
		)
		.await
		.unwrap();

		let root = accelerated.snapshot.unwrap();
		let unchanged = root.lookup("unchanged/x.txt").unwrap();
		assert!(matches!(unchanged, Entry::File { .. }));
		let changed = root.lookup("changed.txt").unwrap();
		match changed {
			Entry::File { digest, .. } => {
				assert_eq!(digest, &crate::hash::digest(HashAlgorithm::Blake3, b"after"));
			}
			other => panic!("expected file, got {:?}", other),
		}
	}
}

// vim: ts=4
