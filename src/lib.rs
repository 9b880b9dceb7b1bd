//! # tor-launcher
//!
//! Supervision of a locally spawned Tor daemon.
//!
//! The crate is built from three parts:
//!
//! - a handshake watcher ([`HandshakeWatcher`]) that polls the watch
//!   directory until the daemon has written a valid authentication cookie
//!   and control port,
//! - a control port client ([`TorControl`]) that authenticates with the
//!   cookie, runs commands one at a time and dispatches asynchronous events
//!   to subscribers,
//! - a process supervisor ([`TorLauncher`]) that launches the daemon,
//!   sequences the two components above, tracks the daemon's state and
//!   relaunches it after a crash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tor_launcher::{LauncherSettings, LoggingObserver, TorConfig, TorLauncher, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let launcher = TorLauncher::new(LauncherSettings::new());
//!     launcher.add_observer(Arc::new(LoggingObserver));
//!
//!     launcher.launch_tor_process(TorConfig::new(
//!         "/usr/bin/tor",
//!         "/tmp/tor/data",
//!         "/tmp/tor/watch",
//!     ))?;
//!
//!     // Later, once bootstrapped
//!     println!("Proxy: {}", launcher.tor_proxy_uri());
//!     Ok(())
//! }
//! ```
//!
//! ## Observers
//!
//! Implement [`TorLauncherObserver`] to receive lifecycle notifications:
//!
//! ```rust,no_run
//! use tor_launcher::TorLauncherObserver;
//!
//! struct Progress;
//!
//! impl TorLauncherObserver for Progress {
//!     fn on_tor_initializing(&self, percentage: &str) {
//!         println!("Bootstrapped {}%", percentage);
//!     }
//!
//!     fn on_tor_circuit_established(&self, established: bool) {
//!         println!("Circuit established: {}", established);
//!     }
//! }
//! ```
//!
//! ## Control client
//!
//! The control client can also be used on its own with a credential from
//! the watcher:
//!
//! ```rust,no_run
//! # use tor_launcher::{HandshakeWatcher, LauncherSettings, TorControl, WatchOutcome};
//! # use tokio_util::sync::CancellationToken;
//! # async fn example() -> tor_launcher::Result<()> {
//! let settings = LauncherSettings::new();
//! let watcher = HandshakeWatcher::from_settings("/tmp/tor/watch", &settings);
//! if let WatchOutcome::Ready(credential) = watcher.watch(CancellationToken::new()).await {
//!     let (notices, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     let mut control = TorControl::new(&settings, notices);
//!     control.start(credential.cookie, credential.port).await?;
//!     println!("Tor {}", control.get_version().await?);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod launcher;
pub mod observer;
pub mod process;
pub mod protocol;
pub mod types;
pub mod watcher;

#[cfg(test)]
mod test_utils;

// Re-export main types for convenience
pub use error::{HandshakeError, Result, TorLauncherError};

pub use auth::{ControlCookie, Credential};
pub use config::{CookieAuth, LauncherSettings, TorConfig};
pub use connection::{ControlNotice, EventSink, TorControl};
pub use events::{ControlEvent, Event, StatusClient, TorControlEvent};
pub use launcher::TorLauncher;
pub use observer::{LoggingObserver, ObserverId, TorLauncherObserver};
pub use process::{DaemonLauncher, DaemonProcess, TorProcessLauncher};
pub use protocol::{Reply, ReplyLine};
pub use types::{ControlState, ProcessRecord};
pub use watcher::{HandshakeWatcher, WatchOutcome};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
