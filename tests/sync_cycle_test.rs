//! Full synchronization cycles driven over two live `LocalEndpoint`s:
//! scan, reconcile, stage/supply, transition, and ancestor folding, the
//! same sequence the controller performs each cycle.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use mutagen_sync_core::config::{SessionConfiguration, SymlinkMode, SynchronizationMode};
use mutagen_sync_core::endpoint::{Endpoint, LocalEndpoint, ScanResult};
use mutagen_sync_core::entry::{replace_at, Entry, Snapshot};
use mutagen_sync_core::reconciler::{reconcile, staging_targets, Conflict};

struct Side {
	endpoint: LocalEndpoint,
	root: TempDir,
	_data: TempDir,
}

fn side(config: &SessionConfiguration) -> Side {
	let root = TempDir::new().unwrap();
	let data = TempDir::new().unwrap();
	let endpoint = LocalEndpoint::new(
		root.path().to_path_buf(),
		data.path().join("cache.redb"),
		data.path().join("staging"),
		config.clone(),
		false,
	)
	.unwrap();
	Side { endpoint, root, _data: data }
}

struct CycleOutcome {
	ancestor: Snapshot,
	conflicts: Vec<Conflict>,
	transition_count: usize,
	staged_file_count: usize,
}

async fn scan(endpoint: &mut LocalEndpoint, ancestor: &Snapshot) -> Snapshot {
	match endpoint.scan(ancestor, true).await.unwrap() {
		ScanResult::Ready { snapshot, .. } => snapshot,
		ScanResult::Retry => panic!("unexpected scan retry"),
	}
}

async fn stage_one_side(
	receiver: &mut LocalEndpoint,
	provider: &mut LocalEndpoint,
	changes: &[mutagen_sync_core::reconciler::Change],
) -> usize {
	if changes.is_empty() {
		return 0;
	}
	let (paths, digests) = staging_targets(changes);
	if paths.is_empty() {
		return 0;
	}
	let mut staged = receiver.stage(&paths, &digests).await.unwrap();
	if !staged.filtered_paths.is_empty() {
		provider.supply(&staged.filtered_paths, &staged.signatures, staged.receiver.as_mut()).await.unwrap();
	}
	staged.filtered_paths.len()
}

/// One controller cycle's worth of work, minus watching.
async fn run_cycle(alpha: &mut Side, beta: &mut Side, ancestor: &Snapshot, mode: SynchronizationMode) -> CycleOutcome {
	let alpha_snapshot = scan(&mut alpha.endpoint, ancestor).await;
	let beta_snapshot = scan(&mut beta.endpoint, ancestor).await;

	let reconciled = reconcile(ancestor, &alpha_snapshot, &beta_snapshot, mode);
	let mut staged_file_count = 0;
	staged_file_count += stage_one_side(&mut alpha.endpoint, &mut beta.endpoint, &reconciled.alpha_changes).await;
	staged_file_count += stage_one_side(&mut beta.endpoint, &mut alpha.endpoint, &reconciled.beta_changes).await;

	let mut transition_count = 0;
	let mut ancestor = ancestor.clone();
	for change in &reconciled.ancestor_changes {
		ancestor = replace_at(&ancestor, &change.path, change.new.clone());
	}
	for (endpoint, changes) in [(&mut alpha.endpoint, &reconciled.alpha_changes), (&mut beta.endpoint, &reconciled.beta_changes)] {
		if changes.is_empty() {
			continue;
		}
		transition_count += changes.len();
		let outcome = endpoint.transition(changes).await.unwrap();
		assert!(outcome.problems.is_empty(), "unexpected problems: {:?}", outcome.problems);
		for result in &outcome.results {
			ancestor = replace_at(&ancestor, &result.path, result.entry.clone());
		}
	}

	CycleOutcome { ancestor, conflicts: reconciled.conflicts, transition_count, staged_file_count }
}

async fn read(root: &Path, rel: &str) -> Vec<u8> {
	tokio::fs::read(root.join(rel)).await.unwrap()
}

fn digest_of(snapshot: &Snapshot, path: &str) -> Vec<u8> {
	match snapshot.as_deref().unwrap().lookup(path) {
		Some(Entry::File { digest, .. }) => digest.clone(),
		other => panic!("expected file at {}, got {:?}", path, other),
	}
}

#[tokio::test]
async fn bidirectional_propagation_of_a_new_file() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("a.txt"), b"hello\n").await.unwrap();

	let outcome = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(outcome.conflicts.is_empty());
	assert_eq!(read(beta.root.path(), "a.txt").await, b"hello\n");

	// The ancestor records the propagated file.
	assert!(matches!(outcome.ancestor.as_deref().unwrap().lookup("a.txt"), Some(Entry::File { .. })));
}

#[tokio::test]
async fn second_cycle_with_no_changes_is_idempotent() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("a.txt"), b"content").await.unwrap();
	tokio::fs::create_dir(alpha.root.path().join("dir")).await.unwrap();
	tokio::fs::write(alpha.root.path().join("dir/b.txt"), b"more").await.unwrap();

	let first = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(first.transition_count > 0);

	let second = run_cycle(&mut alpha, &mut beta, &first.ancestor, SynchronizationMode::TwoWaySafe).await;
	assert_eq!(second.transition_count, 0, "an unchanged tree must produce zero transition operations");
	assert_eq!(second.ancestor, first.ancestor);
}

#[tokio::test]
async fn conflicting_edits_are_surfaced_and_retained() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("notes.md"), b"base").await.unwrap();
	let first = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;

	tokio::fs::write(alpha.root.path().join("notes.md"), b"alpha edit").await.unwrap();
	tokio::fs::write(beta.root.path().join("notes.md"), b"beta edit").await.unwrap();

	let second = run_cycle(&mut alpha, &mut beta, &first.ancestor, SynchronizationMode::TwoWaySafe).await;
	assert_eq!(second.conflicts.len(), 1);
	assert_eq!(second.conflicts[0].path, "notes.md");
	assert_eq!(second.transition_count, 0);

	// Both sides keep their local version; the ancestor still records the
	// pre-conflict content.
	assert_eq!(read(alpha.root.path(), "notes.md").await, b"alpha edit");
	assert_eq!(read(beta.root.path(), "notes.md").await, b"beta edit");
	assert_eq!(second.ancestor, first.ancestor);
}

#[tokio::test]
async fn deleting_the_losing_side_resolves_a_conflict() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("notes.md"), b"base").await.unwrap();
	let first = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWayResolved).await;

	tokio::fs::write(alpha.root.path().join("notes.md"), b"alpha edit").await.unwrap();
	tokio::fs::write(beta.root.path().join("notes.md"), b"beta edit").await.unwrap();
	let second = run_cycle(&mut alpha, &mut beta, &first.ancestor, SynchronizationMode::TwoWayResolved).await;
	assert_eq!(second.conflicts.len(), 1);

	// The user resolves by deleting the losing side; alpha's version then
	// wins over the deletion.
	tokio::fs::remove_file(beta.root.path().join("notes.md")).await.unwrap();
	let third = run_cycle(&mut alpha, &mut beta, &second.ancestor, SynchronizationMode::TwoWayResolved).await;
	assert!(third.conflicts.is_empty());
	assert_eq!(read(beta.root.path(), "notes.md").await, b"alpha edit");
}

#[tokio::test]
async fn rename_is_detected_via_reverse_lookup_without_retransfer() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	// Large enough that an accidental retransfer would be obvious in the
	// staged-file count.
	let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
	tokio::fs::write(alpha.root.path().join("big.bin"), &payload).await.unwrap();

	let first = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert_eq!(first.staged_file_count, 1);
	let digest = digest_of(&first.ancestor, "big.bin");

	tokio::fs::create_dir(alpha.root.path().join("dir")).await.unwrap();
	tokio::fs::rename(alpha.root.path().join("big.bin"), alpha.root.path().join("dir/big.bin")).await.unwrap();

	let second = run_cycle(&mut alpha, &mut beta, &first.ancestor, SynchronizationMode::TwoWaySafe).await;
	assert_eq!(second.staged_file_count, 0, "renamed content must be satisfied by reverse lookup");
	assert!(beta.root.path().join("dir/big.bin").exists());
	assert!(!beta.root.path().join("big.bin").exists());
	assert_eq!(read(beta.root.path(), "dir/big.bin").await, payload);
	assert_eq!(digest_of(&second.ancestor, "dir/big.bin"), digest);
}

#[tokio::test]
async fn decomposed_names_normalize_without_phantom_changes() {
	let config = SessionConfiguration::default();
	let mut alpha = side(&config);
	let mut beta = side(&config);

	// NFD on disk ("cafe" + combining acute); the scanner reports NFC.
	let nfd_name = "cafe\u{0301}.txt";
	tokio::fs::write(alpha.root.path().join(nfd_name), b"au lait").await.unwrap();

	let first = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(matches!(first.ancestor.as_deref().unwrap().lookup("café.txt"), Some(Entry::File { .. })));
	assert_eq!(read(beta.root.path(), "café.txt").await, b"au lait");

	let second = run_cycle(&mut alpha, &mut beta, &first.ancestor, SynchronizationMode::TwoWaySafe).await;
	assert_eq!(second.transition_count, 0, "normalization differences must not produce phantom changes");
}

#[tokio::test]
async fn portable_symlinks_propagate_with_their_targets() {
	let config = SessionConfiguration::default();
	assert_eq!(config.symlink_mode, SymlinkMode::Portable);
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("real.txt"), b"pointed at").await.unwrap();
	tokio::fs::symlink("real.txt", alpha.root.path().join("link")).await.unwrap();

	let outcome = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(outcome.conflicts.is_empty());
	let target = tokio::fs::read_link(beta.root.path().join("link")).await.unwrap();
	assert_eq!(target, PathBuf::from("real.txt"));
}

#[tokio::test]
async fn raw_mode_propagates_absolute_symlink_targets() {
	let mut config = SessionConfiguration::default();
	config.symlink_mode = SymlinkMode::Raw;
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::symlink("/nonexistent/elsewhere", alpha.root.path().join("link")).await.unwrap();

	let outcome = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(outcome.conflicts.is_empty());
	let target = tokio::fs::read_link(beta.root.path().join("link")).await.unwrap();
	assert_eq!(target, PathBuf::from("/nonexistent/elsewhere"));
}

#[tokio::test]
async fn ignore_mode_leaves_symlinks_behind() {
	let mut config = SessionConfiguration::default();
	config.symlink_mode = SymlinkMode::Ignore;
	let mut alpha = side(&config);
	let mut beta = side(&config);

	tokio::fs::write(alpha.root.path().join("real.txt"), b"pointed at").await.unwrap();
	tokio::fs::symlink("real.txt", alpha.root.path().join("link")).await.unwrap();

	let outcome = run_cycle(&mut alpha, &mut beta, &None, SynchronizationMode::TwoWaySafe).await;
	assert!(outcome.conflicts.is_empty());
	assert_eq!(read(beta.root.path(), "real.txt").await, b"pointed at");
	assert!(tokio::fs::symlink_metadata(beta.root.path().join("link")).await.is_err());
	assert!(outcome.ancestor.as_deref().unwrap().lookup("link").is_none());
}

#[tokio::test]
async fn stage_beyond_the_entry_cap_fails_without_mutating_state() {
	let mut config = SessionConfiguration::default();
	config.max_entry_count = 4;
	let mut side_a = side(&config);

	// Root + two files = three entries; one slot remains under the cap.
	tokio::fs::write(side_a.root.path().join("one.txt"), b"1").await.unwrap();
	tokio::fs::write(side_a.root.path().join("two.txt"), b"2").await.unwrap();
	scan(&mut side_a.endpoint, &None).await;

	let paths: Vec<String> = vec!["x.bin".to_string(), "y.bin".to_string()];
	let digests = vec![vec![1u8], vec![2u8]];
	assert!(side_a.endpoint.stage(&paths, &digests).await.is_err());

	// The failed call must not have consumed the scan; a within-cap stage
	// still succeeds.
	let outcome = side_a.endpoint.stage(&paths[..1], &digests[..1]).await.unwrap();
	assert_eq!(outcome.filtered_paths, vec!["x.bin".to_string()]);
}

// vim: ts=4
