//! The synchronization tree: `Entry` is the unit of state, `Snapshot` its
//! root. Trees are immutable once constructed; a scan produces a whole new
//! tree (structurally sharing unchanged subtrees via `Arc`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::util::is_valid_entry_name;

/// A single node in the synchronization tree: directory, file, or symlink,
/// plus the scanner's placeholder variants for content it declined to
/// read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
	Directory {
		/// NFC-normalized name → child, ordered for deterministic traversal.
		contents: BTreeMap<String, Arc<Entry>>,
	},
	File {
		executable: bool,
		digest: Vec<u8>,
	},
	Symlink {
		target: String,
	},
	/// The scanner declined to read this path's content but needs to record
	/// its presence (e.g. unsupported file type).
	Untracked,
	/// The scanner encountered an error reading this path; carries a
	/// human-readable message surfaced as a `Problem`.
	Problem {
		message: String,
	},
}

/// The root of a synchronization tree. `None` represents absent content
/// (a nil root).
pub type Snapshot = Option<Arc<Entry>>;

impl Entry {
	pub fn empty_directory() -> Entry {
		Entry::Directory { contents: BTreeMap::new() }
	}

	pub fn is_directory(&self) -> bool {
		matches!(self, Entry::Directory { .. })
	}

	/// Two entries are "equal" for reconciliation purposes when their full
	/// subtrees match structurally — `PartialEq` already does this since
	/// `BTreeMap<String, Arc<Entry>>` compares by value through the `Arc`.
	pub fn subtree_eq(a: &Snapshot, b: &Snapshot) -> bool {
		a == b
	}

	/// Kind discriminant ignoring contents, used to detect type changes
	/// (file↔dir, file↔symlink) that the reconciler decomposes into
	/// delete-then-create pairs.
	pub fn kind(&self) -> EntryKind {
		match self {
			Entry::Directory { .. } => EntryKind::Directory,
			Entry::File { .. } => EntryKind::File,
			Entry::Symlink { .. } => EntryKind::Symlink,
			Entry::Untracked => EntryKind::Untracked,
			Entry::Problem { .. } => EntryKind::Problem,
		}
	}

	/// Walk `path` (slash-separated, relative) down from this entry.
	pub fn lookup(&self, path: &str) -> Option<&Entry> {
		if path.is_empty() {
			return Some(self);
		}
		let Entry::Directory { contents } = self else {
			return None;
		};
		let (head, rest) = match path.split_once('/') {
			Some((h, r)) => (h, r),
			None => (path, ""),
		};
		contents.get(head).and_then(|child| child.lookup(rest))
	}
}

/// Replace the subtree at `path` (slash-separated, relative; empty means
/// the root itself) within `tree`, cloning only along the spine from the
/// root to the mutated path. A `None` replacement removes the entry;
/// intermediate directories are created as needed.
pub fn replace_at(tree: &Snapshot, path: &str, replacement: Snapshot) -> Snapshot {
	let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	replace_components(tree.as_ref(), &components, replacement)
}

fn replace_components(tree: Option<&Arc<Entry>>, components: &[&str], replacement: Snapshot) -> Snapshot {
	match components.split_first() {
		None => replacement,
		Some((head, rest)) => {
			let mut contents = match tree.map(|e| e.as_ref()) {
				Some(Entry::Directory { contents }) => contents.clone(),
				_ => BTreeMap::new(),
			};
			let child = contents.get(*head).cloned();
			match replace_components(child.as_ref(), rest, replacement) {
				Some(new_child) => {
					contents.insert(head.to_string(), new_child);
				}
				None => {
					contents.remove(*head);
				}
			}
			Some(Arc::new(Entry::Directory { contents }))
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
	Directory,
	File,
	Symlink,
	Untracked,
	Problem,
}

/// Normalize a raw filesystem name into NFC form and validate it as a
/// synchronization entry name. Returns `None` for names that must never
/// appear in a tree (`/`, NUL, `.`, `..`).
pub fn normalize_name(raw: &str) -> Option<String> {
	let nfc: String = raw.nfc().collect();
	if is_valid_entry_name(&nfc) {
		Some(nfc)
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalizes_nfd_to_nfc() {
		let nfd = "cafe\u{0301}.txt"; // "café.txt" decomposed
		let normalized = normalize_name(nfd).unwrap();
		assert_eq!(normalized, "café.txt");
		assert_eq!(normalized.chars().count(), 8);
	}

	#[test]
	fn rejects_invalid_names() {
		assert!(normalize_name("..").is_none());
		assert!(normalize_name(".").is_none());
		assert!(normalize_name("a/b").is_none());
	}

	#[test]
	fn lookup_descends_tree() {
		let leaf = Arc::new(Entry::File { executable: false, digest: vec![1, 2, 3] });
		let mut dir_contents = BTreeMap::new();
		dir_contents.insert("b.txt".to_string(), leaf.clone());
		let mut root_contents = BTreeMap::new();
		root_contents.insert("a".to_string(), Arc::new(Entry::Directory { contents: dir_contents }));
		let root = Entry::Directory { contents: root_contents };

		let found = root.lookup("a/b.txt").unwrap();
		assert_eq!(found, &*leaf);
		assert!(root.lookup("a/missing.txt").is_none());
	}

	#[test]
	fn subtree_equality_structural_sharing() {
		let a: Snapshot = Some(Arc::new(Entry::empty_directory()));
		let b: Snapshot = Some(Arc::new(Entry::empty_directory()));
		assert!(Entry::subtree_eq(&a, &b));
	}

	#[test]
	fn replace_at_rewrites_only_the_spine() {
		let shared = Arc::new(Entry::File { executable: false, digest: vec![1] });
		let mut dir_contents = BTreeMap::new();
		dir_contents.insert("kept.txt".to_string(), shared.clone());
		let mut root_contents = BTreeMap::new();
		root_contents.insert("dir".to_string(), Arc::new(Entry::Directory { contents: dir_contents }));
		let tree: Snapshot = Some(Arc::new(Entry::Directory { contents: root_contents }));

		let new_leaf: Snapshot = Some(Arc::new(Entry::File { executable: false, digest: vec![2] }));
		let updated = replace_at(&tree, "dir/new.txt", new_leaf);

		let root = updated.as_deref().unwrap();
		assert!(matches!(root.lookup("dir/new.txt"), Some(Entry::File { digest, .. }) if digest == &vec![2]));
		assert_eq!(root.lookup("dir/kept.txt"), Some(&*shared));

		let removed = replace_at(&updated, "dir/kept.txt", None);
		assert!(removed.as_deref().unwrap().lookup("dir/kept.txt").is_none());
	}

	#[test]
	fn kind_detects_type_change() {
		let file = Entry::File { executable: false, digest: vec![] };
		let symlink = Entry::Symlink { target: "x".to_string() };
		assert_ne!(file.kind(), symlink.kind());
	}
}

// vim: ts=4
