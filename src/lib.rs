//! # Mutagen synchronization core
//!
//! Continuous, bidirectional file synchronization between two endpoints: a
//! per-session controller drives repeated cycles of watching, scanning,
//! three-way reconciliation, rsync-based staging, and atomic transition.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mutagen_sync_core::config::SessionConfiguration;
//! use mutagen_sync_core::controller::Controller;
//! use mutagen_sync_core::session::{DataDirectory, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(
//!         "/home/me/project".into(),
//!         "/mnt/replica/project".into(),
//!         SessionConfiguration::default(),
//!         Default::default(),
//!     );
//!     let data = DataDirectory::new("/home/me/.mutagen".into());
//!     let controller = Controller::new(session, data, connector).await?;
//!     let handle = controller.handle();
//!     tokio::spawn(controller.run());
//!     // ... observe handle.state(), handle.pause()/resume()/stop() ...
//!     Ok(())
//! }
//! ```
//!
//! Transport dialing, URL parsing, the CLI, and daemon lifecycle are
//! external collaborators: callers hand the controller an
//! `EndpointConnector` and (for remote sides) a connected byte stream for
//! `protocol::RemoteEndpoint`.

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod exclusion;
pub mod hash;
pub mod logging;
pub mod protocol;
pub mod reconciler;
pub mod rsync;
pub mod scanner;
pub mod session;
pub mod stager;
pub mod transitioner;
pub mod util;
pub mod watcher;

// Re-export commonly used types and functions
pub use config::{SessionConfiguration, SynchronizationMode};
pub use controller::{Controller, ControllerHandle, EndpointConnector};
pub use endpoint::{Endpoint, LocalEndpoint, ScanResult, StageOutcome};
pub use entry::{Entry, Snapshot};
pub use error::{ErrorClass, SyncError};
pub use reconciler::{reconcile, Change, Conflict};
pub use session::{DataDirectory, Session, SessionState, SessionStatus};

// vim: ts=4
