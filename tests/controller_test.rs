//! Controller-level behavior: the full state machine running against two
//! live local roots, observed through its handle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use mutagen_sync_core::config::SessionConfiguration;
use mutagen_sync_core::controller::{Controller, ControllerHandle, EndpointConnector};
use mutagen_sync_core::endpoint::{Endpoint, LocalEndpoint};
use mutagen_sync_core::error::SyncError;
use mutagen_sync_core::session::{DataDirectory, Session, SessionStatus};

struct LocalConnector {
	session: String,
	alpha_root: PathBuf,
	beta_root: PathBuf,
	configuration: SessionConfiguration,
	data: DataDirectory,
}

#[async_trait]
impl EndpointConnector for LocalConnector {
	async fn connect(&self, alpha: bool) -> Result<Box<dyn Endpoint>, SyncError> {
		let root = if alpha { self.alpha_root.clone() } else { self.beta_root.clone() };
		let endpoint = LocalEndpoint::new(
			root,
			self.data.cache_path(&self.session, alpha),
			self.data.staging_path(&self.session, alpha),
			self.configuration.clone(),
			false,
		)?;
		Ok(Box::new(endpoint))
	}
}

struct Harness {
	handle: ControllerHandle,
	runner: tokio::task::JoinHandle<()>,
	alpha_root: TempDir,
	beta_root: TempDir,
	_data: TempDir,
}

async fn start(configuration: SessionConfiguration) -> Harness {
	let alpha_root = TempDir::new().unwrap();
	let beta_root = TempDir::new().unwrap();
	let data_dir = TempDir::new().unwrap();

	let data = DataDirectory::new(data_dir.path().to_path_buf());
	let session = Session::new(
		alpha_root.path().display().to_string(),
		beta_root.path().display().to_string(),
		configuration.clone(),
		BTreeMap::new(),
	);
	let connector = LocalConnector {
		session: session.identifier.clone(),
		alpha_root: alpha_root.path().to_path_buf(),
		beta_root: beta_root.path().to_path_buf(),
		configuration,
		data: data.clone(),
	};

	let controller = Controller::new(session, data, Box::new(connector)).await.unwrap();
	let handle = controller.handle();
	let runner = tokio::spawn(controller.run());
	Harness { handle, runner, alpha_root, beta_root, _data: data_dir }
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
	for _ in 0..300 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	panic!("timed out waiting for {}", what);
}

async fn wait_for_status(handle: &ControllerHandle, status: SessionStatus) {
	for _ in 0..300 {
		if handle.state().await.status == status {
			return;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	panic!("timed out waiting for status {:?}, last was {:?}", status, handle.state().await.status);
}

#[tokio::test]
async fn a_new_file_propagates_to_beta() {
	let harness = start(SessionConfiguration::default()).await;
	tokio::fs::write(harness.alpha_root.path().join("a.txt"), b"hello\n").await.unwrap();

	let beta_file = harness.beta_root.path().join("a.txt");
	wait_until(|| beta_file.exists(), "a.txt to appear on beta").await;
	assert_eq!(tokio::fs::read(&beta_file).await.unwrap(), b"hello\n");

	let state = harness.handle.state().await;
	assert!(state.successful_cycles >= 1);
	assert!(state.conflicts.is_empty());

	harness.handle.stop();
	harness.runner.await.unwrap();
}

#[tokio::test]
async fn deleting_the_beta_root_halts_without_propagating() {
	let harness = start(SessionConfiguration::default()).await;
	tokio::fs::write(harness.alpha_root.path().join("keep.txt"), b"precious").await.unwrap();

	let beta_file = harness.beta_root.path().join("keep.txt");
	wait_until(|| beta_file.exists(), "keep.txt to appear on beta").await;

	tokio::fs::remove_dir_all(harness.beta_root.path()).await.unwrap();
	wait_for_status(&harness.handle, SessionStatus::HaltedOnRootDeletion).await;

	// The deletion must not have been propagated back to alpha.
	assert!(harness.alpha_root.path().join("keep.txt").exists());

	harness.handle.stop();
	harness.runner.await.unwrap();
}

#[tokio::test]
async fn pause_stops_the_cycle_and_resume_restarts_it() {
	let harness = start(SessionConfiguration::default()).await;
	tokio::fs::write(harness.alpha_root.path().join("one.txt"), b"1").await.unwrap();

	let one = harness.beta_root.path().join("one.txt");
	wait_until(|| one.exists(), "one.txt to appear on beta").await;

	harness.handle.pause();
	wait_for_status(&harness.handle, SessionStatus::Disconnected).await;

	// Changes made while paused stay local.
	tokio::fs::write(harness.alpha_root.path().join("two.txt"), b"2").await.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(!harness.beta_root.path().join("two.txt").exists());

	harness.handle.resume();
	let two = harness.beta_root.path().join("two.txt");
	wait_until(|| two.exists(), "two.txt to appear after resume").await;

	harness.handle.stop();
	harness.runner.await.unwrap();
}

// vim: ts=4
