//! Asynchronous events from the daemon.
//!
//! The supervisor subscribes to four event classes. Notifications for those
//! classes arrive as `650` lines and are turned into a [`ControlEvent`]
//! (class, first-line text and any `KEY=VALUE` extras), which
//! [`ControlEvent::decode`] maps onto the semantic [`Event`] variants.

use crate::error::TorLauncherError;
use crate::protocol::{parse_key_value_pairs, Reply};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

const BOOTSTRAP: &str = "BOOTSTRAP";
const BOOTSTRAP_PROGRESS: &str = "PROGRESS=";
const CIRCUIT_ESTABLISHED: &str = "CIRCUIT_ESTABLISHED";
const CIRCUIT_NOT_ESTABLISHED: &str = "CIRCUIT_NOT_ESTABLISHED";

/// Event classes that can be subscribed to with SETEVENTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TorControlEvent {
    /// Network liveness changed.
    NetworkLiveness,
    /// Client status event (bootstrap, circuits).
    StatusClient,
    /// General status event.
    StatusGeneral,
    /// Stream status changed.
    Stream,
}

impl TorControlEvent {
    /// All classes, in the order the supervisor subscribes to them.
    pub const ALL: [TorControlEvent; 4] = [
        TorControlEvent::NetworkLiveness,
        TorControlEvent::StatusClient,
        TorControlEvent::StatusGeneral,
        TorControlEvent::Stream,
    ];

    /// Get the event keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            TorControlEvent::NetworkLiveness => "NETWORK_LIVENESS",
            TorControlEvent::StatusClient => "STATUS_CLIENT",
            TorControlEvent::StatusGeneral => "STATUS_GENERAL",
            TorControlEvent::Stream => "STREAM",
        }
    }
}

impl FromStr for TorControlEvent {
    type Err = TorLauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NETWORK_LIVENESS" => Ok(TorControlEvent::NetworkLiveness),
            "STATUS_CLIENT" => Ok(TorControlEvent::StatusClient),
            "STATUS_GENERAL" => Ok(TorControlEvent::StatusGeneral),
            "STREAM" => Ok(TorControlEvent::Stream),
            other => Err(TorLauncherError::ParseError(format!(
                "Unknown event type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for TorControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A STATUS_CLIENT notification the supervisor acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusClient {
    /// Bootstrap progress, verbatim text of the `PROGRESS=` argument.
    BootstrapProgress(String),
    /// A circuit became usable (`true`) or stopped being usable (`false`).
    CircuitEstablished(bool),
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Unstructured line, kept for diagnostics.
    RawLine(String),
    /// Client status change.
    StatusClient(StatusClient),
    /// Network liveness changed.
    NetworkLiveness(bool),
    /// Reply to a version query.
    VersionReply(String),
    /// Reply to a SOCKS listener query, raw address strings.
    ListenersReply(Vec<String>),
}

/// An asynchronous notification for one of the subscribed classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    /// The event class.
    pub class: TorControlEvent,
    /// Text following the class keyword on the first line.
    pub initial: String,
    /// `KEY=VALUE` pairs from continuation lines.
    pub extra: HashMap<String, String>,
}

impl ControlEvent {
    /// Build an event from a complete `650` reply.
    ///
    /// Returns `None` for notifications of classes outside the subscription set.
    pub fn from_reply(reply: &Reply) -> Option<Self> {
        if !reply.is_async_event() {
            return None;
        }

        let mut parts = reply.first_line().splitn(2, ' ');
        let class = TorControlEvent::from_str(parts.next()?).ok()?;
        let initial = parts.next().unwrap_or("").to_string();

        let mut extra = HashMap::new();
        // The terminating "650 OK" of a multi-line notification carries nothing.
        let continuation = reply.lines.len().saturating_sub(1);
        for line in reply.lines.iter().take(continuation).skip(1) {
            extra.extend(parse_key_value_pairs(&line.text));
        }

        Some(ControlEvent {
            class,
            initial,
            extra,
        })
    }

    /// Map this notification onto a semantic event.
    pub fn decode(&self) -> Event {
        let decoded = match self.class {
            TorControlEvent::StatusClient => parse_status_client(&self.initial).map(Event::StatusClient),
            TorControlEvent::NetworkLiveness => parse_network_liveness(&self.initial),
            TorControlEvent::StatusGeneral | TorControlEvent::Stream => None,
        };
        decoded.unwrap_or_else(|| Event::RawLine(self.to_string()))
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.initial)
    }
}

/// Tokenized STATUS_CLIENT text: `<severity> <action> [arguments]`.
struct StatusLine<'a> {
    action: &'a str,
    arguments: &'a str,
}

impl<'a> StatusLine<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let mut parts = text.trim_start().splitn(3, ' ');
        let _severity = parts.next()?;
        let action = parts.next()?;
        Some(StatusLine {
            action,
            arguments: parts.next().unwrap_or(""),
        })
    }
}

/// Parse the text of a STATUS_CLIENT notification.
///
/// Bootstrap progress is the text between `PROGRESS=` and the next space,
/// unvalidated. A BOOTSTRAP line without the marker yields nothing.
///
/// `BOOTSTRAP` is only recognised as the action word after the severity.
/// Text that merely contains it elsewhere, such as a WARN summary quoting
/// it, is not treated as progress.
pub fn parse_status_client(text: &str) -> Option<StatusClient> {
    let line = StatusLine::parse(text)?;
    match line.action {
        BOOTSTRAP => {
            let start = line.arguments.find(BOOTSTRAP_PROGRESS)? + BOOTSTRAP_PROGRESS.len();
            let rest = &line.arguments[start..];
            let end = rest.find(' ').unwrap_or(rest.len());
            Some(StatusClient::BootstrapProgress(rest[..end].to_string()))
        }
        CIRCUIT_ESTABLISHED => Some(StatusClient::CircuitEstablished(true)),
        CIRCUIT_NOT_ESTABLISHED => Some(StatusClient::CircuitEstablished(false)),
        _ => None,
    }
}

fn parse_network_liveness(text: &str) -> Option<Event> {
    let word = text.split_whitespace().next()?;
    if word.eq_ignore_ascii_case("UP") {
        Some(Event::NetworkLiveness(true))
    } else if word.eq_ignore_ascii_case("DOWN") {
        Some(Event::NetworkLiveness(false))
    } else {
        None
    }
}
