//! Starting the daemon process.
//!
//! The supervisor only talks to the [`DaemonLauncher`] and [`DaemonProcess`]
//! traits, so tests can substitute a scripted launcher. [`TorProcessLauncher`]
//! is the real implementation on top of `tokio::process`.

use crate::config::TorConfig;
use crate::error::{Result, TorLauncherError};
use crate::watcher::{COOKIE_FILE_NAME, PORT_FILE_NAME};

use async_trait::async_trait;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Process-start facility.
#[async_trait]
pub trait DaemonLauncher: Send + Sync + 'static {
    /// Start the daemon for `config` and return a handle to it.
    async fn launch(&self, config: &TorConfig) -> Result<Box<dyn DaemonProcess>>;
}

/// A started daemon process.
#[async_trait]
pub trait DaemonProcess: Send + 'static {
    /// Operating system process id.
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code.
    ///
    /// An error means the process can no longer be watched.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Ask the process to shut down and reap it.
    async fn kill(&mut self) -> Result<()>;
}

/// Command line arguments for a daemon launched with `config`.
///
/// The daemon picks its own ports and reports the control port and the
/// authentication cookie through files in the watch directory.
pub fn tor_args(config: &TorConfig) -> Vec<OsString> {
    let watch = &config.tor_watch_path;
    let mut log = OsString::from("notice file ");
    log.push(config.log_path());

    vec![
        "--ignore-missing-torrc".into(),
        "--SocksPort".into(),
        "auto".into(),
        "--ControlPort".into(),
        "auto".into(),
        "--ControlPortWriteToFile".into(),
        watch.join(PORT_FILE_NAME).into(),
        "--CookieAuthentication".into(),
        "1".into(),
        "--CookieAuthFile".into(),
        watch.join(COOKIE_FILE_NAME).into(),
        "--DataDirectory".into(),
        config.tor_data_path.clone().into(),
        "--Log".into(),
        log,
    ]
}

/// Launches the daemon binary as a child process.
#[derive(Debug, Clone, Default)]
pub struct TorProcessLauncher {
    _private: (),
}

impl TorProcessLauncher {
    /// Create a new launcher.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DaemonLauncher for TorProcessLauncher {
    async fn launch(&self, config: &TorConfig) -> Result<Box<dyn DaemonProcess>> {
        tokio::fs::create_dir_all(&config.tor_data_path).await?;
        tokio::fs::create_dir_all(&config.tor_watch_path).await?;

        let child = Command::new(&config.binary_path)
            .args(tor_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TorLauncherError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to start {}: {}", config.binary_path.display(), e),
                ))
            })?;

        info!(pid = ?child.id(), binary = %config.binary_path.display(), "Daemon started");
        Ok(Box::new(TorChild { child }))
    }
}

struct TorChild {
    child: Child,
}

#[async_trait]
impl DaemonProcess for TorChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        debug!(%status, "Daemon exited");
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_tor_args() {
        let config = TorConfig::new("/usr/bin/tor", "/var/tor/data", "/var/tor/watch");
        let args = tor_args(&config);

        let position = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[position("--SocksPort") + 1], "auto");
        assert_eq!(args[position("--ControlPort") + 1], "auto");
        assert_eq!(
            Path::new(&args[position("--ControlPortWriteToFile") + 1]),
            Path::new("/var/tor/watch/controlport")
        );
        assert_eq!(
            Path::new(&args[position("--CookieAuthFile") + 1]),
            Path::new("/var/tor/watch/control_auth_cookie")
        );
        assert_eq!(args[position("--DataDirectory") + 1], "/var/tor/data");
        assert_eq!(
            args[position("--Log") + 1],
            OsString::from("notice file /var/tor/data/tor.log")
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = TorConfig::new(
            dir.path().join("no-such-binary"),
            dir.path().join("data"),
            dir.path().join("watch"),
        );
        let result = TorProcessLauncher::new().launch(&config).await;
        assert!(matches!(result, Err(TorLauncherError::Io(_))));
        assert!(dir.path().join("watch").is_dir());
    }
}
