//! Three-way reconciliation: diffs `(ancestor, alpha, beta)` into per-side
//! changes and conflicts under one of four synchronization modes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::SynchronizationMode;
use crate::entry::{Entry, Snapshot};

/// `(path, old-entry, new-entry)`: the output of the reconciler and the
/// input of the transitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
	pub path: String,
	pub old: Snapshot,
	pub new: Snapshot,
}

/// A path where both sides changed in incompatible ways under the active
/// synchronization mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
	pub path: String,
	pub alpha_change: Change,
	pub beta_change: Change,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
	pub alpha_changes: Vec<Change>,
	pub beta_changes: Vec<Change>,
	pub ancestor_changes: Vec<Change>,
	pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
	Alpha,
	Beta,
}

/// Diff `(ancestor, alpha, beta)` and resolve divergences per `mode`.
pub fn reconcile(
	ancestor: &Snapshot,
	alpha: &Snapshot,
	beta: &Snapshot,
	mode: SynchronizationMode,
) -> ReconcileOutcome {
	let mut out = ReconcileOutcome::default();
	diff_node("", ancestor, alpha, beta, mode, &mut out);
	out
}

fn diff_node(
	path: &str,
	ancestor: &Snapshot,
	alpha: &Snapshot,
	beta: &Snapshot,
	mode: SynchronizationMode,
	out: &mut ReconcileOutcome,
) {
	let alpha_changed = !Entry::subtree_eq(alpha, ancestor);
	let beta_changed = !Entry::subtree_eq(beta, ancestor);

	if !alpha_changed && !beta_changed {
		return;
	}

	if alpha_changed && !beta_changed {
		apply_one_side_changed(path, ancestor, alpha, Side::Alpha, mode, out);
		return;
	}

	if beta_changed && !alpha_changed {
		apply_one_side_changed(path, ancestor, beta, Side::Beta, mode, out);
		return;
	}

	// Both sides changed from the ancestor.
	if Entry::subtree_eq(alpha, beta) {
		out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() });
		return;
	}

	let both_directories = matches!(alpha.as_deref(), Some(Entry::Directory { .. }))
		&& matches!(beta.as_deref(), Some(Entry::Directory { .. }));

	if both_directories {
		let alpha_contents = dir_contents(alpha);
		let beta_contents = dir_contents(beta);
		let ancestor_contents = dir_contents(ancestor);

		let mut names: BTreeSet<&String> = BTreeSet::new();
		names.extend(alpha_contents.keys());
		names.extend(beta_contents.keys());
		names.extend(ancestor_contents.keys());

		for name in names {
			let child_path = if path.is_empty() { name.clone() } else { format!("{}/{}", path, name) };
			let ancestor_child = ancestor_contents.get(name).cloned().unwrap_or(None);
			let alpha_child = alpha_contents.get(name).cloned().unwrap_or(None);
			let beta_child = beta_contents.get(name).cloned().unwrap_or(None);
			diff_node(&child_path, &ancestor_child, &alpha_child, &beta_child, mode, out);
		}
		return;
	}

	resolve_conflict(path, ancestor, alpha, beta, mode, out);
}

/// Collect the `(path, digest)` pairs a side must have staged before it can
/// transition `changes`: every file in a change's new subtree that differs
/// from the corresponding old entry.
pub fn staging_targets(changes: &[Change]) -> (Vec<String>, Vec<Vec<u8>>) {
	let mut paths = Vec::new();
	let mut digests = Vec::new();
	for change in changes {
		collect_file_targets(&change.path, &change.old, &change.new, &mut paths, &mut digests);
	}
	(paths, digests)
}

fn collect_file_targets(path: &str, old: &Snapshot, new: &Snapshot, paths: &mut Vec<String>, digests: &mut Vec<Vec<u8>>) {
	if Entry::subtree_eq(old, new) {
		return;
	}
	match new.as_deref() {
		Some(Entry::File { digest, .. }) => {
			paths.push(path.to_string());
			digests.push(digest.clone());
		}
		Some(Entry::Directory { contents }) => {
			let old_contents = match old.as_deref() {
				Some(Entry::Directory { contents }) => Some(contents),
				_ => None,
			};
			for (name, child) in contents {
				let child_path = if path.is_empty() { name.clone() } else { format!("{}/{}", path, name) };
				let child_old: Snapshot = old_contents.and_then(|c| c.get(name).cloned());
				collect_file_targets(&child_path, &child_old, &Some(child.clone()), paths, digests);
			}
		}
		_ => {}
	}
}

/// Queue a change for one side's transition list, decomposing a type change
/// (file↔dir, file↔symlink) into a delete-then-create pair so the
/// transitioner never has to interpret a cross-kind replacement.
fn push_change(list: &mut Vec<Change>, path: &str, old: &Snapshot, new: &Snapshot) {
	match (old.as_deref(), new.as_deref()) {
		(Some(o), Some(n)) if o.kind() != n.kind() => {
			list.push(Change { path: path.to_string(), old: old.clone(), new: None });
			list.push(Change { path: path.to_string(), old: None, new: new.clone() });
		}
		_ => list.push(Change { path: path.to_string(), old: old.clone(), new: new.clone() }),
	}
}

fn dir_contents(snapshot: &Snapshot) -> BTreeMap<String, Snapshot> {
	match snapshot.as_deref() {
		Some(Entry::Directory { contents }) => {
			contents.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect()
		}
		_ => BTreeMap::new(),
	}
}

fn apply_one_side_changed(
	path: &str,
	ancestor: &Snapshot,
	changed_value: &Snapshot,
	side: Side,
	mode: SynchronizationMode,
	out: &mut ReconcileOutcome,
) {
	match mode {
		SynchronizationMode::TwoWaySafe | SynchronizationMode::TwoWayResolved => {
			match side {
				Side::Alpha => push_change(&mut out.beta_changes, path, ancestor, changed_value),
				Side::Beta => push_change(&mut out.alpha_changes, path, ancestor, changed_value),
			}
			out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: changed_value.clone() });
		}
		SynchronizationMode::OneWaySafe => match side {
			Side::Alpha => {
				push_change(&mut out.beta_changes, path, ancestor, changed_value);
				out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: changed_value.clone() });
			}
			// A beta-only local edit with alpha unchanged is not unsafe: it
			// simply isn't propagated anywhere, and the ancestor is left
			// alone so the divergence is re-evaluated every cycle.
			Side::Beta => {}
		},
		SynchronizationMode::OneWayReplica => match side {
			Side::Alpha => {
				push_change(&mut out.beta_changes, path, ancestor, changed_value);
				out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: changed_value.clone() });
			}
			// Beta diverged unilaterally; force it back to the ancestor
			// (which still equals alpha, since alpha is unchanged here).
			Side::Beta => {
				push_change(&mut out.beta_changes, path, changed_value, ancestor);
			}
		},
	}
}

fn resolve_conflict(
	path: &str,
	ancestor: &Snapshot,
	alpha: &Snapshot,
	beta: &Snapshot,
	mode: SynchronizationMode,
	out: &mut ReconcileOutcome,
) {
	match mode {
		SynchronizationMode::TwoWaySafe => {
			out.conflicts.push(Conflict {
				path: path.to_string(),
				alpha_change: Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() },
				beta_change: Change { path: path.to_string(), old: ancestor.clone(), new: beta.clone() },
			});
		}
		SynchronizationMode::TwoWayResolved => {
			match (alpha.is_none(), beta.is_none()) {
				(true, false) => {
					// Alpha deleted but beta has content; beta's non-deletion
					// wins. Alpha's on-disk state is the deletion, so the
					// change it must apply starts from nothing.
					push_change(&mut out.alpha_changes, path, alpha, beta);
					out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: beta.clone() });
				}
				(false, true) => {
					push_change(&mut out.beta_changes, path, beta, alpha);
					out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() });
				}
				// Both are non-deletions and differ, or both are
				// deletions (already handled by the equality check above).
				_ => {
					out.conflicts.push(Conflict {
						path: path.to_string(),
						alpha_change: Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() },
						beta_change: Change { path: path.to_string(), old: ancestor.clone(), new: beta.clone() },
					});
				}
			}
		}
		SynchronizationMode::OneWaySafe => {
			// Beta's change would overwrite alpha's change; refuse.
			out.conflicts.push(Conflict {
				path: path.to_string(),
				alpha_change: Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() },
				beta_change: Change { path: path.to_string(), old: ancestor.clone(), new: beta.clone() },
			});
		}
		SynchronizationMode::OneWayReplica => {
			push_change(&mut out.beta_changes, path, beta, alpha);
			out.ancestor_changes.push(Change { path: path.to_string(), old: ancestor.clone(), new: alpha.clone() });
		}
	}
}


// vim: ts=4
