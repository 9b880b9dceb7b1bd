//! Handshake watcher.
//!
//! After launch the daemon writes two files into the watch directory: a raw
//! 32-byte authentication cookie and a `PORT=<host>:<port>` line naming its
//! control listener. The files appear asynchronously and may be partially
//! written when probed, so every probe is independent and a failed probe is
//! just "not ready yet".
//!
//! File reads run on the blocking pool; [`HandshakeWatcher::watch`] polls on
//! a fixed interval until both files validate in the same attempt, the
//! attempt budget runs out, or the caller cancels.

use crate::auth::{ControlCookie, Credential, COOKIE_LEN};
use crate::config::LauncherSettings;
use crate::error::HandshakeError;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// File holding the authentication cookie.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";
/// File holding the control port line.
pub const PORT_FILE_NAME: &str = "controlport";

const PORT_PREFIX: &str = "PORT=";
// "PORT=" + bracketed IPv6 + ":65535" + CRLF fits comfortably.
const MAX_PORT_FILE_LEN: u64 = 64;

/// Terminal result of a watch round.
#[derive(Debug)]
pub enum WatchOutcome {
    /// Both files validated in the same attempt.
    Ready(Credential),
    /// The attempt budget ran out; the caller may start another round.
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Why the last attempt failed.
        last_error: Option<HandshakeError>,
    },
    /// The watch was cancelled.
    Cancelled,
}

/// Polls the watch directory for the daemon's handshake files.
#[derive(Debug, Clone)]
pub struct HandshakeWatcher {
    watch_dir: PathBuf,
    interval: Duration,
    max_attempts: u32,
    not_before: Option<SystemTime>,
}

impl HandshakeWatcher {
    /// Create a watcher over `watch_dir` with default polling settings.
    pub fn new(watch_dir: impl Into<PathBuf>) -> Self {
        Self::from_settings(watch_dir, &LauncherSettings::default())
    }

    /// Create a watcher using the polling settings of the launcher.
    pub fn from_settings(watch_dir: impl Into<PathBuf>, settings: &LauncherSettings) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            interval: settings.watch_interval,
            max_attempts: settings.watch_attempts.max(1),
            not_before: None,
        }
    }

    /// Set the poll interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of attempts per watch round.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Distrust files last modified before `time`.
    pub fn not_before(mut self, time: Option<SystemTime>) -> Self {
        self.not_before = time;
        self
    }

    /// Path of the cookie file.
    pub fn cookie_path(&self) -> PathBuf {
        self.watch_dir.join(COOKIE_FILE_NAME)
    }

    /// Path of the port file.
    pub fn port_path(&self) -> PathBuf {
        self.watch_dir.join(PORT_FILE_NAME)
    }

    /// Read and validate the cookie file.
    ///
    /// Returns the cookie and the file's modification time. Any length other
    /// than exactly 32 bytes is rejected; nothing is returned partially.
    pub fn read_control_cookie(&self) -> Result<(ControlCookie, SystemTime), HandshakeError> {
        let path = self.cookie_path();
        let (len, modified) = self.probe(&path)?;
        if len != COOKIE_LEN as u64 {
            return Err(HandshakeError::CookieLength(len));
        }

        let data = fs::read(&path).map_err(|e| unreadable(&path, e))?;
        let cookie = ControlCookie::from_bytes(&data)
            .ok_or(HandshakeError::CookieLength(data.len() as u64))?;
        Ok((cookie, modified))
    }

    /// Read and validate the port file.
    ///
    /// Returns the port and the file's modification time.
    pub fn read_control_port(&self) -> Result<(u16, SystemTime), HandshakeError> {
        let path = self.port_path();
        let (len, modified) = self.probe(&path)?;
        if len > MAX_PORT_FILE_LEN {
            return Err(HandshakeError::Malformed(format!("file is {} bytes", len)));
        }

        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => HandshakeError::Malformed("not valid UTF-8".to_string()),
            _ => unreadable(&path, e),
        })?;
        let port = parse_port_file(&text)?;
        Ok((port, modified))
    }

    /// One polling attempt: both files must validate.
    pub fn poll_once(&self) -> Result<Credential, HandshakeError> {
        let (cookie, _) = self.read_control_cookie()?;
        let (port, _) = self.read_control_port()?;
        Ok(Credential {
            cookie,
            port,
            extracted_at: SystemTime::now(),
        })
    }

    /// Poll until both files validate, the attempts run out or `cancel` fires.
    pub async fn watch(self, cancel: CancellationToken) -> WatchOutcome {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let watcher = self.clone();
            let probe = tokio::task::spawn_blocking(move || watcher.poll_once());

            let polled = tokio::select! {
                polled = probe => polled,
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            };

            match polled {
                Ok(Ok(credential)) => {
                    debug!(attempt, port = credential.port, "Handshake files ready");
                    return WatchOutcome::Ready(credential);
                }
                Ok(Err(e)) => {
                    trace!(attempt, error = %e, "Handshake not ready");
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Handshake probe task failed");
                    last_error = None;
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                }
            }
        }

        WatchOutcome::Exhausted {
            attempts: self.max_attempts,
            last_error,
        }
    }

    /// Stat a handshake file: must be a regular file, fresh enough.
    fn probe(&self, path: &Path) -> Result<(u64, SystemTime), HandshakeError> {
        let metadata = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => HandshakeError::Missing {
                path: path.to_path_buf(),
            },
            _ => unreadable(path, e),
        })?;

        if !metadata.is_file() {
            return Err(HandshakeError::NotAFile {
                path: path.to_path_buf(),
            });
        }

        let modified = metadata.modified().map_err(|e| unreadable(path, e))?;
        if let Some(not_before) = self.not_before {
            if modified < not_before {
                return Err(HandshakeError::Stale {
                    path: path.to_path_buf(),
                });
            }
        }

        Ok((metadata.len(), modified))
    }
}

fn unreadable(path: &Path, source: io::Error) -> HandshakeError {
    HandshakeError::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}

/// Parse the contents of a port file.
///
/// Exactly one line `PORT=<host>:<port>` terminated by `\n` or `\r\n` is
/// accepted, `<host>` must be a loopback address and `<port>` a decimal
/// number in 1-65535.
pub fn parse_port_file(text: &str) -> Result<u16, HandshakeError> {
    let rest = text
        .strip_prefix(PORT_PREFIX)
        .ok_or_else(|| HandshakeError::Malformed("missing PORT= prefix".to_string()))?;

    let (line, tail) = rest.split_once('\n').ok_or(HandshakeError::Truncated)?;
    if !tail.is_empty() {
        return Err(HandshakeError::Malformed(
            "trailing data after port line".to_string(),
        ));
    }
    let line = line.strip_suffix('\r').unwrap_or(line);

    let (host, port) = line
        .rsplit_once(':')
        .ok_or_else(|| HandshakeError::Malformed("missing port separator".to_string()))?;

    let is_loopback = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|addr| addr.is_loopback())
        .unwrap_or(false);
    if !is_loopback {
        return Err(HandshakeError::NotLoopback(host.to_string()));
    }

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandshakeError::Malformed(format!(
            "invalid port number '{}'",
            port
        )));
    }

    match port.parse::<u32>() {
        Ok(0) => Err(HandshakeError::PortOutOfRange(0)),
        Ok(value) => u16::try_from(value).map_err(|_| HandshakeError::PortOverflow),
        Err(_) => Err(HandshakeError::PortOverflow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;
    use tempfile::TempDir;

    fn watch_dir() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write(dir: &TempDir, name: &str, contents: &[u8]) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    fn port_result(contents: &str) -> Result<u16, HandshakeError> {
        let dir = watch_dir();
        write(&dir, PORT_FILE_NAME, contents.as_bytes());
        HandshakeWatcher::new(dir.path())
            .read_control_port()
            .map(|(port, _)| port)
    }

    #[test]
    fn test_cookie_missing() {
        let dir = watch_dir();
        let err = HandshakeWatcher::new(dir.path().join("not_valid"))
            .read_control_cookie()
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Missing { .. }));
    }

    #[test]
    fn test_cookie_is_directory() {
        let dir = watch_dir();
        fs::create_dir(dir.path().join(COOKIE_FILE_NAME)).unwrap();
        let err = HandshakeWatcher::new(dir.path())
            .read_control_cookie()
            .unwrap_err();
        assert!(matches!(err, HandshakeError::NotAFile { .. }));
    }

    #[test]
    fn test_cookie_wrong_lengths() {
        for len in [0usize, 31, 33, 4096] {
            let dir = watch_dir();
            write(&dir, COOKIE_FILE_NAME, &vec![0x42; len]);
            let err = HandshakeWatcher::new(dir.path())
                .read_control_cookie()
                .unwrap_err();
            assert!(
                matches!(err, HandshakeError::CookieLength(l) if l == len as u64),
                "length {} gave {:?}",
                len,
                err
            );
        }
    }

    #[test]
    fn test_cookie_normal() {
        let dir = watch_dir();
        write(&dir, COOKIE_FILE_NAME, &fixtures::AUTH_COOKIE);
        let (cookie, modified) = HandshakeWatcher::new(dir.path())
            .read_control_cookie()
            .unwrap();
        assert_eq!(cookie.as_bytes(), &fixtures::AUTH_COOKIE[..]);
        assert_eq!(cookie.len(), 32);
        assert!(modified > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_port_normal() {
        assert_eq!(port_result("PORT=127.0.0.1:5566\n").unwrap(), 5566);
        assert_eq!(port_result("PORT=127.0.0.1:5566\r\n").unwrap(), 5566);
        assert_eq!(port_result("PORT=[::1]:9151\n").unwrap(), 9151);
    }

    #[test]
    fn test_port_missing_or_directory() {
        let dir = watch_dir();
        let watcher = HandshakeWatcher::new(dir.path());
        assert!(matches!(
            watcher.read_control_port().unwrap_err(),
            HandshakeError::Missing { .. }
        ));

        fs::create_dir(dir.path().join(PORT_FILE_NAME)).unwrap();
        let err = watcher.read_control_port().unwrap_err();
        assert!(matches!(err, HandshakeError::NotAFile { .. }));
        assert_eq!(err.reported_port(None), None);
    }

    #[test]
    fn test_port_empty_and_invalid() {
        let err = port_result("").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
        assert_eq!(err.reported_port(None), None);

        let err = port_result("PORT=127.0.0.1:55x6\n").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));

        let err = port_result("PORT=127.0.0.1\n").unwrap_err();
        assert!(matches!(err, HandshakeError::NotLoopback(_) | HandshakeError::Malformed(_)));
    }

    #[test]
    fn test_port_not_loopback() {
        for contents in ["PORT=10.0.0.1:5566\n", "PORT=192.168.1.2:99999\n", "PORT=example.com:5566\n"] {
            let err = port_result(contents).unwrap_err();
            assert!(matches!(err, HandshakeError::NotLoopback(_)), "{:?}", err);
            assert_eq!(err.reported_port(None), None);
        }
    }

    #[test]
    fn test_port_trailing_garbage() {
        let err = port_result("PORT=127.0.0.1:5566\nPORT=127.0.0.1:5567\n").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
        assert_eq!(err.reported_port(None), None);
    }

    #[test]
    fn test_port_overflow_reports_sentinel() {
        for contents in ["PORT=127.0.0.1:65536\n", "PORT=127.0.0.1:99999999999999\r\n"] {
            let err = port_result(contents).unwrap_err();
            assert!(matches!(err, HandshakeError::PortOverflow));
            assert_eq!(err.reported_port(None), Some(65536));
        }
    }

    #[test]
    fn test_port_zero_is_out_of_range() {
        let err = port_result("PORT=127.0.0.1:0\n").unwrap_err();
        assert!(matches!(err, HandshakeError::PortOutOfRange(0)));
    }

    #[test]
    fn test_port_truncated_reports_zero() {
        let err = port_result("PORT=127.0.0.1:5566").unwrap_err();
        assert!(matches!(err, HandshakeError::Truncated));
        assert_eq!(err.reported_port(None), Some(0));
        assert_eq!(err.reported_port(Some(5566)), Some(5566));
    }

    #[test]
    fn test_stale_files_are_distrusted() {
        let dir = watch_dir();
        write(&dir, COOKIE_FILE_NAME, &fixtures::AUTH_COOKIE);
        write(&dir, PORT_FILE_NAME, b"PORT=127.0.0.1:5566\n");
        let later = SystemTime::now() + Duration::from_secs(3600);
        let watcher = HandshakeWatcher::new(dir.path()).not_before(Some(later));
        assert!(matches!(
            watcher.read_control_cookie().unwrap_err(),
            HandshakeError::Stale { .. }
        ));
        assert!(matches!(
            watcher.read_control_port().unwrap_err(),
            HandshakeError::Stale { .. }
        ));
    }

    #[test]
    fn test_poll_is_idempotent() {
        let dir = watch_dir();
        write(&dir, COOKIE_FILE_NAME, &fixtures::AUTH_COOKIE);
        write(&dir, PORT_FILE_NAME, b"PORT=127.0.0.1:5566\n");
        let watcher = HandshakeWatcher::new(dir.path());

        let first = watcher.poll_once().unwrap();
        let second = watcher.poll_once().unwrap();
        assert_eq!(first.cookie, second.cookie);
        assert_eq!(first.port, second.port);
        assert_eq!(
            watcher.read_control_port().unwrap(),
            watcher.read_control_port().unwrap()
        );
    }

    #[test]
    fn test_poll_requires_both_files() {
        let dir = watch_dir();
        write(&dir, COOKIE_FILE_NAME, &fixtures::AUTH_COOKIE);
        assert!(HandshakeWatcher::new(dir.path()).poll_once().is_err());
    }

    #[tokio::test]
    async fn test_watch_waits_for_files() {
        let dir = watch_dir();
        let path = dir.path().to_path_buf();
        let watcher = HandshakeWatcher::new(&path)
            .interval(Duration::from_millis(10))
            .max_attempts(500);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fs::write(path.join(COOKIE_FILE_NAME), fixtures::AUTH_COOKIE).unwrap();
            fs::write(path.join(PORT_FILE_NAME), "PORT=127.0.0.1:5566\n").unwrap();
        });

        match watcher.watch(CancellationToken::new()).await {
            WatchOutcome::Ready(credential) => {
                assert_eq!(credential.port, 5566);
                assert_eq!(credential.cookie.as_bytes(), &fixtures::AUTH_COOKIE[..]);
            }
            other => panic!("expected ready, got {:?}", other),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_exhausts() {
        let dir = watch_dir();
        let watcher = HandshakeWatcher::new(dir.path())
            .interval(Duration::from_millis(1))
            .max_attempts(3);

        match watcher.watch(CancellationToken::new()).await {
            WatchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, Some(HandshakeError::Missing { .. })));
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_cancelled() {
        let dir = watch_dir();
        let watcher = HandshakeWatcher::new(dir.path())
            .interval(Duration::from_secs(60))
            .max_attempts(10);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.watch(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), WatchOutcome::Cancelled));
    }
}
