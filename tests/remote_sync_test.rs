//! Drives a full synchronization cycle where one side sits behind the wire
//! codec: a `LocalEndpoint` alpha and a `RemoteEndpoint` beta served over
//! an in-memory duplex stream.

use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use mutagen_sync_core::config::SessionConfiguration;
use mutagen_sync_core::endpoint::{Endpoint, LocalEndpoint, ScanResult};
use mutagen_sync_core::entry::{replace_at, Snapshot};
use mutagen_sync_core::error::SyncError;
use mutagen_sync_core::protocol::{serve_endpoint, InitializeRequest, RemoteEndpoint};
use mutagen_sync_core::reconciler::{reconcile, staging_targets};
use mutagen_sync_core::session::DataDirectory;

struct RemoteSide {
	endpoint: RemoteEndpoint<DuplexStream>,
	root: TempDir,
	server: JoinHandle<Result<(), SyncError>>,
	_data: TempDir,
}

async fn remote_side(alpha: bool, config: &SessionConfiguration) -> RemoteSide {
	let root = TempDir::new().unwrap();
	let data = TempDir::new().unwrap();

	let (client_stream, server_stream) = tokio::io::duplex(1024 * 1024);
	let server_data = DataDirectory::new(data.path().to_path_buf());
	let server = tokio::spawn(async move { serve_endpoint(server_stream, &server_data).await });

	let request = InitializeRequest {
		session: "remote-test".to_string(),
		alpha,
		root: root.path().display().to_string(),
		configuration: config.clone(),
	};
	let endpoint = RemoteEndpoint::connect(client_stream, request).await.unwrap();
	RemoteSide { endpoint, root, server, _data: data }
}

fn local_side(config: &SessionConfiguration) -> (LocalEndpoint, TempDir, TempDir) {
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
	(endpoint, root, data)
}

async fn scan(endpoint: &mut dyn Endpoint, ancestor: &Snapshot) -> Snapshot {
	match endpoint.scan(ancestor, true).await.unwrap() {
		ScanResult::Ready { snapshot, .. } => snapshot,
		ScanResult::Retry => panic!("unexpected scan retry"),
	}
}

#[tokio::test]
async fn a_file_propagates_to_a_remote_beta() {
	let config = SessionConfiguration::default();
	let (mut alpha, alpha_root, _alpha_data) = local_side(&config);
	let mut beta = remote_side(false, &config).await;

	tokio::fs::write(alpha_root.path().join("shared.txt"), b"over the wire").await.unwrap();

	let ancestor: Snapshot = None;
	let alpha_snapshot = scan(&mut alpha, &ancestor).await;
	let beta_snapshot = scan(&mut beta.endpoint, &ancestor).await;

	let reconciled = reconcile(&ancestor, &alpha_snapshot, &beta_snapshot, config.synchronization_mode);
	assert!(!reconciled.beta_changes.is_empty());

	let (paths, digests) = staging_targets(&reconciled.beta_changes);
	let mut staged = beta.endpoint.stage(&paths, &digests).await.unwrap();
	assert_eq!(staged.filtered_paths, vec!["shared.txt".to_string()]);
	alpha.supply(&staged.filtered_paths, &staged.signatures, staged.receiver.as_mut()).await.unwrap();

	let outcome = beta.endpoint.transition(&reconciled.beta_changes).await.unwrap();
	assert!(outcome.problems.is_empty(), "unexpected problems: {:?}", outcome.problems);
	assert!(outcome.made_changes);

	let written = tokio::fs::read(beta.root.path().join("shared.txt")).await.unwrap();
	assert_eq!(written, b"over the wire");

	beta.endpoint.shutdown().await;
	beta.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn a_remote_alpha_supplies_content_to_a_local_beta() {
	let config = SessionConfiguration::default();
	let mut alpha = remote_side(true, &config).await;
	let (mut beta, beta_root, _beta_data) = local_side(&config);

	tokio::fs::write(alpha.root.path().join("from-remote.txt"), b"pulled down").await.unwrap();

	let ancestor: Snapshot = None;
	let alpha_snapshot = scan(&mut alpha.endpoint, &ancestor).await;
	let beta_snapshot = scan(&mut beta, &ancestor).await;

	let reconciled = reconcile(&ancestor, &alpha_snapshot, &beta_snapshot, config.synchronization_mode);
	let (paths, digests) = staging_targets(&reconciled.beta_changes);
	let mut staged = beta.stage(&paths, &digests).await.unwrap();
	alpha.endpoint.supply(&staged.filtered_paths, &staged.signatures, staged.receiver.as_mut()).await.unwrap();

	let outcome = beta.transition(&reconciled.beta_changes).await.unwrap();
	assert!(outcome.problems.is_empty(), "unexpected problems: {:?}", outcome.problems);

	let written = tokio::fs::read(beta_root.path().join("from-remote.txt")).await.unwrap();
	assert_eq!(written, b"pulled down");

	alpha.endpoint.shutdown().await;
	alpha.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn a_cancelled_poll_leaves_the_stream_usable() {
	let config = SessionConfiguration::default();
	let mut beta = remote_side(false, &config).await;

	// Cancel immediately; the poll completion and response frames must
	// still pair up so the next request finds an aligned stream.
	let mut cancelled = || true;
	beta.endpoint.poll(&mut cancelled).await.unwrap();

	let snapshot = scan(&mut beta.endpoint, &None).await;
	assert!(snapshot.is_some());

	beta.endpoint.shutdown().await;
	beta.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn remote_transition_results_fold_into_the_ancestor() {
	let config = SessionConfiguration::default();
	let (mut alpha, alpha_root, _alpha_data) = local_side(&config);
	let mut beta = remote_side(false, &config).await;

	tokio::fs::write(alpha_root.path().join("a.txt"), b"first").await.unwrap();

	let mut ancestor: Snapshot = None;
	let alpha_snapshot = scan(&mut alpha, &ancestor).await;
	let beta_snapshot = scan(&mut beta.endpoint, &ancestor).await;
	let reconciled = reconcile(&ancestor, &alpha_snapshot, &beta_snapshot, config.synchronization_mode);

	let (paths, digests) = staging_targets(&reconciled.beta_changes);
	let mut staged = beta.endpoint.stage(&paths, &digests).await.unwrap();
	alpha.supply(&staged.filtered_paths, &staged.signatures, staged.receiver.as_mut()).await.unwrap();
	let outcome = beta.endpoint.transition(&reconciled.beta_changes).await.unwrap();

	for change in &reconciled.ancestor_changes {
		ancestor = replace_at(&ancestor, &change.path, change.new.clone());
	}
	for result in &outcome.results {
		ancestor = replace_at(&ancestor, &result.path, result.entry.clone());
	}

	// A second cycle over the updated ancestor converges: no changes on
	// either side.
	let alpha_snapshot = scan(&mut alpha, &ancestor).await;
	let beta_snapshot = scan(&mut beta.endpoint, &ancestor).await;
	let reconciled = reconcile(&ancestor, &alpha_snapshot, &beta_snapshot, config.synchronization_mode);
	assert!(reconciled.alpha_changes.is_empty());
	assert!(reconciled.beta_changes.is_empty());
	assert!(reconciled.conflicts.is_empty());

	beta.endpoint.shutdown().await;
	beta.server.await.unwrap().unwrap();
}

// vim: ts=4
