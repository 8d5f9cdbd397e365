//! Minimal smoke driver: continuously synchronize two local directories.
//! The real daemon, CLI, and transport dialing live outside this crate;
//! this binary exists so the core can be exercised end to end.

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::{env, process};

use async_trait::async_trait;

use mutagen_sync_core::config::SessionConfiguration;
use mutagen_sync_core::controller::{Controller, EndpointConnector};
use mutagen_sync_core::endpoint::{Endpoint, LocalEndpoint};
use mutagen_sync_core::error::SyncError;
use mutagen_sync_core::logging;
use mutagen_sync_core::session::{DataDirectory, Session};

/// Connects both sides of a session to local filesystem roots.
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
		let read_only = alpha && self.configuration.synchronization_mode.alpha_is_read_only();
		let staging_root = self.data.resolve_staging_root(self.configuration.staging_mode, &self.session, alpha, &root);
		let endpoint = LocalEndpoint::new(
			root,
			self.data.cache_path(&self.session, alpha),
			staging_root,
			self.configuration.clone(),
			read_only,
		)?;
		Ok(Box::new(endpoint))
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();

	let mut args = env::args().skip(1);
	let (alpha, beta) = match (args.next(), args.next()) {
		(Some(alpha), Some(beta)) => (PathBuf::from(alpha), PathBuf::from(beta)),
		_ => {
			eprintln!("usage: mutagen-sync-core <alpha-root> <beta-root> [data-dir]");
			process::exit(2);
		}
	};
	let data_root = args.next().map(PathBuf::from).unwrap_or_else(|| env::temp_dir().join("mutagen-sync-core"));

	let data = DataDirectory::new(data_root);
	let session = Session::new(
		alpha.display().to_string(),
		beta.display().to_string(),
		SessionConfiguration::default(),
		BTreeMap::new(),
	);
	let connector = LocalConnector {
		session: session.identifier.clone(),
		alpha_root: alpha,
		beta_root: beta,
		configuration: session.configuration.clone(),
		data: data.clone(),
	};

	let controller = Controller::new(session, data, Box::new(connector)).await?;
	let handle = controller.handle();
	let runner = tokio::spawn(controller.run());

	tokio::signal::ctrl_c().await?;
	handle.stop();
	runner.await?;
	Ok(())
}

// vim: ts=4
