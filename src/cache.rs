//! Per-endpoint cache: `{path → (mtime, size, mode, device+inode, digest)}`,
//! letting the scanner skip re-hashing files whose identity and metadata
//! are unchanged. Also the ignore-decision cache.

use std::collections::{BTreeMap, HashMap};
use std::path;

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;

/// Cached metadata for one path, keyed against a fresh `stat()` to decide
/// whether the scanner may reuse the digest instead of re-hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub mtime_seconds: i64,
	pub mtime_nanos: u32,
	pub size: u64,
	pub mode: u32,
	pub device: u64,
	pub inode: u64,
	pub digest: Vec<u8>,
}

impl CacheEntry {
	/// Is this entry still valid against a freshly observed stat?
	pub fn matches(&self, other: &CacheEntry) -> bool {
		self.mtime_seconds == other.mtime_seconds
			&& self.mtime_nanos == other.mtime_nanos
			&& self.size == other.size
			&& self.mode == other.mode
			&& self.device == other.device
			&& self.inode == other.inode
	}
}

const FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Per-endpoint content cache, backed by an embedded `redb` database so
/// each `set()` is individually transactional. Also maintains an in-memory
/// reverse index (digest → path) for the stager's rename/copy
/// short-circuit.
pub struct Cache {
	db: redb::Database,
	reverse: HashMap<Vec<u8>, String>,
	dirty: bool,
}

impl Cache {
	pub fn open(db_path: &path::Path) -> Result<Self, PersistenceError> {
		if let Some(parent) = db_path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|source| PersistenceError::Io { path: parent.display().to_string(), source })?;
		}
		let db = redb::Database::create(db_path)
			.map_err(|e| PersistenceError::Corrupted { path: db_path.display().to_string(), message: e.to_string() })?;
		{
			let write_txn = db.begin_write().map_err(|e| PersistenceError::Io {
				path: db_path.display().to_string(),
				source: std::io::Error::other(e.to_string()),
			})?;
			let _ = write_txn.open_table(FILES_TABLE);
			let _ = write_txn.commit();
		}

		let mut cache = Cache { db, reverse: HashMap::new(), dirty: false };
		cache.rebuild_reverse_index()?;
		Ok(cache)
	}

	fn rebuild_reverse_index(&mut self) -> Result<(), PersistenceError> {
		let read_txn = self
			.db
			.begin_read()
			.map_err(|e| PersistenceError::Corrupted { path: "cache".into(), message: e.to_string() })?;
		let table = read_txn
			.open_table(FILES_TABLE)
			.map_err(|e| PersistenceError::Corrupted { path: "cache".into(), message: e.to_string() })?;
		let mut iter = table
			.iter()
			.map_err(|e| PersistenceError::Corrupted { path: "cache".into(), message: e.to_string() })?;
		while let Some(Ok((key, value))) = iter.next() {
			if let Ok(entry) = bincode::deserialize::<CacheEntry>(value.value()) {
				self.reverse.insert(entry.digest, key.value().to_string());
			}
		}
		Ok(())
	}

	pub fn get(&self, rel_path: &str) -> Option<CacheEntry> {
		let read_txn = self.db.begin_read().ok()?;
		let table = read_txn.open_table(FILES_TABLE).ok()?;
		let value = table.get(rel_path).ok()??;
		bincode::deserialize(value.value()).ok()
	}

	pub fn set(&mut self, rel_path: &str, entry: CacheEntry) -> Result<(), PersistenceError> {
		let bytes = bincode::serialize(&entry)
			.map_err(|e| PersistenceError::Corrupted { path: rel_path.into(), message: e.to_string() })?;
		let write_txn = self.db.begin_write().map_err(|e| PersistenceError::Io {
			path: rel_path.into(),
			source: std::io::Error::other(e.to_string()),
		})?;
		{
			let mut table = write_txn
				.open_table(FILES_TABLE)
				.map_err(|e| PersistenceError::Io { path: rel_path.into(), source: std::io::Error::other(e.to_string()) })?;
			table
				.insert(rel_path, bytes.as_slice())
				.map_err(|e| PersistenceError::Io { path: rel_path.into(), source: std::io::Error::other(e.to_string()) })?;
		}
		write_txn
			.commit()
			.map_err(|e| PersistenceError::Io { path: rel_path.into(), source: std::io::Error::other(e.to_string()) })?;
		self.reverse.insert(entry.digest.clone(), rel_path.to_string());
		self.dirty = true;
		Ok(())
	}

	/// Lets the stager short-circuit transfers when identical content
	/// already exists somewhere under the root (rename/copy detection).
	pub fn reverse_lookup(&self, digest: &[u8]) -> Option<&str> {
		self.reverse.get(digest).map(|s| s.as_str())
	}

	/// Has the cache changed since the last successful persist? Consulted
	/// by the endpoint's ~60s cache-saver background task.
	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn mark_persisted(&mut self) {
		self.dirty = false;
	}

	/// Durably settle accumulated writes. Each `set` already commits its own
	/// transaction, so this compacts the database file and clears the dirty
	/// flag.
	pub fn persist(&mut self) -> Result<(), PersistenceError> {
		self.db
			.compact()
			.map_err(|e| PersistenceError::Io { path: "cache".into(), source: std::io::Error::other(e.to_string()) })?;
		self.dirty = false;
		Ok(())
	}

	pub fn clear(&mut self) -> Result<(), PersistenceError> {
		let write_txn = self.db.begin_write().map_err(|e| PersistenceError::Io {
			path: "cache".into(),
			source: std::io::Error::other(e.to_string()),
		})?;
		{
			let mut table = write_txn
				.open_table(FILES_TABLE)
				.map_err(|e| PersistenceError::Io { path: "cache".into(), source: std::io::Error::other(e.to_string()) })?;
			let keys: Vec<String> = {
				let mut iter = table
					.iter()
					.map_err(|e| PersistenceError::Io { path: "cache".into(), source: std::io::Error::other(e.to_string()) })?;
				let mut keys = Vec::new();
				while let Some(Ok((key, _))) = iter.next() {
					keys.push(key.value().to_string());
				}
				keys
			};
			for key in keys {
				table
					.remove(key.as_str())
					.map_err(|e| PersistenceError::Io { path: key, source: std::io::Error::other(e.to_string()) })?;
			}
		}
		write_txn
			.commit()
			.map_err(|e| PersistenceError::Io { path: "cache".into(), source: std::io::Error::other(e.to_string()) })?;
		self.reverse.clear();
		self.dirty = false;
		Ok(())
	}
}

/// Decision cache keyed by (path, is-directory), invalidated wholesale
/// whenever the ignore pattern list changes.
#[derive(Default)]
pub struct IgnoreCache {
	decisions: BTreeMap<(String, bool), bool>,
}

impl IgnoreCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, path: &str, is_directory: bool) -> Option<bool> {
		self.decisions.get(&(path.to_string(), is_directory)).copied()
	}

	pub fn set(&mut self, path: &str, is_directory: bool, excluded: bool) {
		self.decisions.insert((path.to_string(), is_directory), excluded);
	}

	/// Invalidate every cached decision, e.g. because the ignore pattern
	/// list changed.
	pub fn invalidate(&mut self) {
		self.decisions.clear();
	}
}


// vim: ts=4
