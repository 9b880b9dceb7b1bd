//! Configuration for launching and supervising the daemon.
//!
//! [`TorConfig`] names the three paths a launch needs. [`LauncherSettings`]
//! holds the tunables for the supervisor, the handshake watcher and the
//! control client.

use crate::error::{Result, TorLauncherError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the daemon log file inside the data directory.
pub const LOG_FILE_NAME: &str = "tor.log";

/// Paths for one daemon launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConfig {
    /// The daemon executable.
    pub binary_path: PathBuf,
    /// The daemon's data directory.
    pub tor_data_path: PathBuf,
    /// Directory the daemon writes its cookie and port files to.
    pub tor_watch_path: PathBuf,
}

impl TorConfig {
    /// Create a new launch configuration.
    pub fn new(
        binary_path: impl Into<PathBuf>,
        tor_data_path: impl Into<PathBuf>,
        tor_watch_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            tor_data_path: tor_data_path.into(),
            tor_watch_path: tor_watch_path.into(),
        }
    }

    /// Reject configurations with an empty path.
    pub fn validate(&self) -> Result<()> {
        let fields: [(&str, &Path); 3] = [
            ("binary_path", &self.binary_path),
            ("tor_data_path", &self.tor_data_path),
            ("tor_watch_path", &self.tor_watch_path),
        ];
        for (name, path) in fields {
            if path.as_os_str().is_empty() {
                return Err(TorLauncherError::Configuration(format!(
                    "{} must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Path of the daemon log file.
    pub fn log_path(&self) -> PathBuf {
        self.tor_data_path.join(LOG_FILE_NAME)
    }
}

/// How the control client proves knowledge of the cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookieAuth {
    /// Send the cookie itself, hex encoded.
    Cookie,
    /// HMAC challenge/response; the cookie never crosses the wire.
    #[default]
    SafeCookie,
}

/// Tunables for the supervisor and its components.
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    /// Delay before relaunching after a crash.
    pub relaunch_delay: Duration,
    /// Interval between handshake polls.
    pub watch_interval: Duration,
    /// Number of polls before a watch round gives up.
    pub watch_attempts: u32,
    /// Tolerance when comparing handshake file times with the launch time.
    pub mtime_slack: Duration,
    /// Cookie authentication flavour.
    pub auth: CookieAuth,
    /// Whether the client takes ownership of the daemon after authenticating.
    pub take_ownership: bool,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            relaunch_delay: Duration::from_secs(1),
            watch_interval: Duration::from_secs(1),
            watch_attempts: 10,
            mtime_slack: Duration::from_secs(1),
            auth: CookieAuth::default(),
            take_ownership: true,
        }
    }
}

impl LauncherSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relaunch delay.
    pub fn relaunch_delay(mut self, delay: Duration) -> Self {
        self.relaunch_delay = delay;
        self
    }

    /// Set the handshake poll interval.
    pub fn watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Set the number of polls per watch round.
    pub fn watch_attempts(mut self, attempts: u32) -> Self {
        self.watch_attempts = attempts;
        self
    }

    /// Set the file time tolerance.
    pub fn mtime_slack(mut self, slack: Duration) -> Self {
        self.mtime_slack = slack;
        self
    }

    /// Set the cookie authentication flavour.
    pub fn auth(mut self, auth: CookieAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Enable or disable taking ownership of the daemon.
    pub fn take_ownership(mut self, enabled: bool) -> Self {
        self.take_ownership = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = LauncherSettings::default();
        assert_eq!(settings.relaunch_delay, Duration::from_secs(1));
        assert_eq!(settings.auth, CookieAuth::SafeCookie);
        assert!(settings.take_ownership);
    }

    #[test]
    fn test_settings_builder() {
        let settings = LauncherSettings::new()
            .relaunch_delay(Duration::from_millis(50))
            .watch_interval(Duration::from_millis(10))
            .watch_attempts(3)
            .auth(CookieAuth::Cookie)
            .take_ownership(false);

        assert_eq!(settings.relaunch_delay, Duration::from_millis(50));
        assert_eq!(settings.watch_interval, Duration::from_millis(10));
        assert_eq!(settings.watch_attempts, 3);
        assert_eq!(settings.auth, CookieAuth::Cookie);
        assert!(!settings.take_ownership);
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        assert!(TorConfig::new("/usr/bin/tor", "/data", "/watch")
            .validate()
            .is_ok());

        let err = TorConfig::new("", "/data", "/watch").validate().unwrap_err();
        assert!(matches!(err, TorLauncherError::Configuration(_)));
        assert!(TorConfig::new("/usr/bin/tor", "", "/watch")
            .validate()
            .is_err());
        assert!(TorConfig::new("/usr/bin/tor", "/data", "")
            .validate()
            .is_err());
    }

    #[test]
    fn test_log_path() {
        let config = TorConfig::new("/usr/bin/tor", "/data", "/watch");
        assert_eq!(config.log_path(), PathBuf::from("/data/tor.log"));
    }
}
