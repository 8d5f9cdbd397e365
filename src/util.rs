//! Small shared helpers: atomic persistence and path normalization.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::PersistenceError;

/// Write `bytes` to `path` atomically: write to a sibling temp file, fsync,
/// then rename over the destination. Used by every persisted record
/// (caches, archives, sessions) so readers always see either the pre- or
/// post-write content, never a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	tokio::fs::create_dir_all(parent)
		.await
		.map_err(|source| PersistenceError::Io { path: path.display().to_string(), source })?;

	let tmp_name = format!(
		".{}.tmp-{}",
		path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
		std::process::id()
	);
	let tmp_path = parent.join(tmp_name);

	{
		let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|source| {
			PersistenceError::Io { path: tmp_path.display().to_string(), source }
		})?;
		file.write_all(bytes).await.map_err(|source| PersistenceError::Io {
			path: tmp_path.display().to_string(),
			source,
		})?;
		file.sync_all().await.map_err(|source| PersistenceError::Io {
			path: tmp_path.display().to_string(),
			source,
		})?;
	}

	tokio::fs::rename(&tmp_path, path)
		.await
		.map_err(|source| PersistenceError::Io { path: path.display().to_string(), source })?;

	Ok(())
}

/// Validate a single path component as a synchronization entry name: must
/// not be empty, must not contain a path separator or NUL, and must not be
/// `.` or `..`.
pub fn is_valid_entry_name(name: &str) -> bool {
	if name.is_empty() || name == "." || name == ".." {
		return false;
	}
	!name.contains('/') && !name.contains('\\') && !name.contains('\0')
}

/// Is this a relative, slash-separated path with no `..` components?
pub fn is_path_safe(path: &Path) -> bool {
	!path.is_absolute() && !path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Join a root-relative synchronization path onto a filesystem root,
/// refusing to escape the root.
pub fn resolve_under_root(root: &Path, relative: &str) -> Option<PathBuf> {
	let rel = Path::new(relative);
	if !is_path_safe(rel) {
		return None;
	}
	Some(root.join(rel))
}


// vim: ts=4
