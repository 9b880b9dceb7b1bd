//! Core types shared by the supervisor and the control client.

use std::fmt;

/// Scheme of the proxy URI handed to consumers.
pub const TOR_PROXY_SCHEME: &str = "socks5://";

/// Lifecycle state of the supervised daemon.
///
/// Owned by the supervisor; consumers see read-only snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Process id of the running daemon.
    pub pid: Option<u32>,
    /// Set from the launch request until the daemon reports it is up.
    pub starting: bool,
    /// Set once a circuit is established; cleared on any loss.
    pub connected: bool,
    /// Proxy URI derived from the first SOCKS listener.
    pub proxy_uri: String,
    /// Daemon version string.
    pub version: String,
}

impl ProcessRecord {
    /// The daemon has been launched and is past its start phase.
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && !self.starting
    }
}

/// State of a control port connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No connection; `start` may be called.
    Disconnected,
    /// Opening the TCP stream.
    Connecting,
    /// Stream open, authentication in progress.
    Authenticating,
    /// Authenticated; commands and subscriptions are accepted.
    Ready,
    /// Stopped for good.
    Closed,
}

impl ControlState {
    /// Get the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Disconnected => "disconnected",
            ControlState::Connecting => "connecting",
            ControlState::Authenticating => "authenticating",
            ControlState::Ready => "ready",
            ControlState::Closed => "closed",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split the value of `net/listeners/socks` into raw listener strings.
///
/// Quotes are kept; [`proxy_uri_from_listener`] strips them.
pub fn parse_socks_listeners(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

/// Build the proxy URI for a listener, dropping embedded quotes.
pub fn proxy_uri_from_listener(listener: &str) -> String {
    let mut uri = String::from(TOR_PROXY_SCHEME);
    uri.extend(listener.chars().filter(|&c| c != '"'));
    uri
}
