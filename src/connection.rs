//! Control port client.
//!
//! [`TorControl`] owns one connection to the daemon's control port. `start`
//! connects and authenticates with the cookie; afterwards a connection task
//! owns the stream and all connection state: it writes queued commands one
//! at a time, matches each terminal reply line to the oldest outstanding
//! command, and hands asynchronous notifications to the subscribers of
//! their class as they arrive.
//!
//! ```text
//! Disconnected ─start─► Connecting ─► Authenticating ─► Ready
//!      ▲                    │               │             │
//!      └──── failure ───────┴───────────────┘   I/O error─┘
//! any state ─stop─► Closed
//! ```

use crate::auth::{
    compute_client_hash, format_cookie_hex, generate_client_nonce,
    parse_authchallenge_response, verify_server_hash, ControlCookie,
};
use crate::config::{CookieAuth, LauncherSettings};
use crate::error::{Result, TorLauncherError};
use crate::events::{ControlEvent, TorControlEvent};
use crate::protocol::{format_command, Decoded, LineDecoder, Reply};
use crate::types::{parse_socks_listeners, ControlState};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Split};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Receives the notifications of one or more subscribed classes.
pub type EventSink = mpsc::UnboundedSender<ControlEvent>;

/// Notifications from the client to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlNotice {
    /// The connection dropped; `was_running` is set if it had reached `Ready`.
    Closed {
        /// Whether the connection was ready when it dropped.
        was_running: bool,
    },
    /// A line or reply that could not be attributed to anything.
    Raw(String),
}

enum Request {
    Command {
        line: String,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Subscribe {
        class: TorControlEvent,
        sink: EventSink,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Unsubscribe {
        class: TorControlEvent,
        reply: oneshot::Sender<Result<Reply>>,
    },
}

/// A client for one control port connection.
pub struct TorControl {
    auth: CookieAuth,
    take_ownership: bool,
    state: Arc<watch::Sender<ControlState>>,
    requests: Option<mpsc::UnboundedSender<Request>>,
    cancel: CancellationToken,
    notices: mpsc::UnboundedSender<ControlNotice>,
}

impl TorControl {
    /// Create a disconnected client reporting to `notices`.
    pub fn new(settings: &LauncherSettings, notices: mpsc::UnboundedSender<ControlNotice>) -> Self {
        let (state, _) = watch::channel(ControlState::Disconnected);
        Self {
            auth: settings.auth,
            take_ownership: settings.take_ownership,
            state: Arc::new(state),
            requests: None,
            cancel: CancellationToken::new(),
            notices,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    /// Connect to `127.0.0.1:port` and authenticate with `cookie`.
    ///
    /// Only valid from `Disconnected`. The returned future resolves once the
    /// client is `Ready`; on failure the client is `Disconnected` again.
    pub fn start(
        &mut self,
        cookie: ControlCookie,
        port: u16,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let current = self.state();
        let accepted = current == ControlState::Disconnected;
        let (tx, rx) = mpsc::unbounded_channel();
        if accepted {
            self.requests = Some(tx);
            self.state.send_replace(ControlState::Connecting);
        }

        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let notices = self.notices.clone();
        let auth = self.auth;
        let take_ownership = self.take_ownership;

        async move {
            if !accepted {
                return Err(TorLauncherError::InvalidState(format!(
                    "cannot start from {}",
                    current
                )));
            }

            let opened = tokio::select! {
                opened = Session::open(port, &cookie, auth, take_ownership, &state, &notices) => opened,
                _ = cancel.cancelled() => Err(TorLauncherError::Cancelled),
            };
            drop(cookie);

            match opened {
                Ok(session) if !cancel.is_cancelled() => {
                    state.send_replace(ControlState::Ready);
                    debug!(port, "Control connection ready");
                    tokio::spawn(session.run(rx, cancel, notices, state));
                    Ok(())
                }
                Ok(_) => Err(TorLauncherError::Cancelled),
                Err(e) => {
                    state.send_if_modified(|s| {
                        if *s == ControlState::Closed {
                            return false;
                        }
                        *s = ControlState::Disconnected;
                        true
                    });
                    debug!(port, error = %e, "Control connection failed");
                    Err(e)
                }
            }
        }
    }

    /// Close the connection and cancel outstanding commands.
    ///
    /// Valid in every state; the client is `Closed` afterwards.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.requests = None;
        if self.state.send_replace(ControlState::Closed) != ControlState::Closed {
            debug!("Control connection stopped");
        }
    }

    /// Send a raw command line and receive its reply.
    pub fn send_command(
        &self,
        line: impl Into<String>,
    ) -> impl Future<Output = Result<Reply>> + Send + 'static {
        let mut line = line.into();
        if !line.ends_with("\r\n") {
            line.push_str("\r\n");
        }
        self.request(|reply| Request::Command { line, reply })
    }

    /// Get the daemon version.
    pub fn get_version(&self) -> impl Future<Output = Result<String>> + Send + 'static {
        let reply = self.send_command(format_command("GETINFO", &["version"]));
        async move {
            let reply = reply.await?.into_result()?;
            reply
                .value_of("version")
                .map(String::from)
                .ok_or_else(|| {
                    TorLauncherError::ParseError("Version not found in response".to_string())
                })
        }
    }

    /// Get the SOCKS listener addresses, as sent by the daemon.
    pub fn get_socks_listeners(
        &self,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + 'static {
        let reply = self.send_command(format_command("GETINFO", &["net/listeners/socks"]));
        async move {
            let reply = reply.await?.into_result()?;
            reply
                .value_of("net/listeners/socks")
                .map(parse_socks_listeners)
                .ok_or_else(|| {
                    TorLauncherError::ParseError("SOCKS listeners not found in response".to_string())
                })
        }
    }

    /// Deliver notifications of `class` to `sink`.
    ///
    /// Resolves once the daemon acknowledged the updated event set.
    pub fn subscribe(
        &self,
        class: TorControlEvent,
        sink: EventSink,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let reply = self.request(move |reply| Request::Subscribe { class, sink, reply });
        async move { reply.await?.into_result().map(|_| ()) }
    }

    /// Stop delivering notifications of `class`.
    pub fn unsubscribe(
        &self,
        class: TorControlEvent,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let reply = self.request(move |reply| Request::Unsubscribe { class, reply });
        async move { reply.await?.into_result().map(|_| ()) }
    }

    fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<Reply>>) -> Request,
    ) -> impl Future<Output = Result<Reply>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let current = self.state();
        let sent = match (&self.requests, current) {
            (Some(requests), ControlState::Ready) => requests.send(build(reply)).is_ok(),
            _ => false,
        };

        async move {
            if !sent {
                return Err(if current == ControlState::Ready {
                    TorLauncherError::ConnectionClosed
                } else {
                    TorLauncherError::InvalidState(format!("client is {}", current))
                });
            }
            rx.await.unwrap_or(Err(TorLauncherError::ConnectionClosed))
        }
    }
}

impl Drop for TorControl {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How the connection task ended.
enum Exit {
    Stopped,
    Failed(TorLauncherError),
}

struct Queued {
    line: String,
    reply: oneshot::Sender<Result<Reply>>,
}

/// An open control connection.
struct Session {
    lines: Split<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
    decoder: LineDecoder,
}

impl Session {
    async fn open(
        port: u16,
        cookie: &ControlCookie,
        auth: CookieAuth,
        take_ownership: bool,
        state: &watch::Sender<ControlState>,
        notices: &mpsc::UnboundedSender<ControlNotice>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| {
                TorLauncherError::ConnectionFailed(format!("127.0.0.1:{}: {}", port, e))
            })?;
        state.send_replace(ControlState::Authenticating);

        let (read_half, write_half) = stream.into_split();
        let mut session = Session {
            lines: BufReader::new(read_half).split(b'\n'),
            writer: BufWriter::new(write_half),
            decoder: LineDecoder::new(),
        };

        session.authenticate(cookie, auth, notices).await?;
        if take_ownership {
            session
                .command(&format_command("TAKEOWNERSHIP", &[]), notices)
                .await?
                .into_result()?;
            session
                .command(
                    &format_command("RESETCONF", &["__OwningControllerProcess"]),
                    notices,
                )
                .await?
                .into_result()?;
        }
        Ok(session)
    }

    async fn authenticate(
        &mut self,
        cookie: &ControlCookie,
        auth: CookieAuth,
        notices: &mpsc::UnboundedSender<ControlNotice>,
    ) -> Result<()> {
        match auth {
            CookieAuth::Cookie => {
                debug!("Authenticating with cookie");
                let hex = format_cookie_hex(cookie.as_bytes());
                let reply = self
                    .command(&format_command("AUTHENTICATE", &[&hex]), notices)
                    .await?;
                reply.into_result().map_err(|_| {
                    TorLauncherError::AuthenticationFailed("Invalid cookie".to_string())
                })?;
            }
            CookieAuth::SafeCookie => {
                debug!("Authenticating with SAFECOOKIE");

                let client_nonce = generate_client_nonce();
                let client_nonce_hex = hex::encode_upper(client_nonce);

                let cmd = format_command("AUTHCHALLENGE", &["SAFECOOKIE", &client_nonce_hex]);
                let reply = self.command(&cmd, notices).await?.into_result()?;

                let (server_hash, server_nonce) =
                    parse_authchallenge_response(reply.first_line())?;

                if !verify_server_hash(cookie.as_bytes(), &client_nonce, &server_nonce, &server_hash)
                {
                    return Err(TorLauncherError::AuthenticationFailed(
                        "Server hash verification failed".to_string(),
                    ));
                }

                let client_hash =
                    compute_client_hash(cookie.as_bytes(), &client_nonce, &server_nonce);
                let client_hash_hex = hex::encode_upper(client_hash);

                let reply = self
                    .command(&format_command("AUTHENTICATE", &[&client_hash_hex]), notices)
                    .await?;
                reply.into_result().map_err(|_| {
                    TorLauncherError::AuthenticationFailed(
                        "SAFECOOKIE authentication failed".to_string(),
                    )
                })?;
            }
        }

        debug!("Authentication successful");
        Ok(())
    }

    /// Write a command and wait for its reply; only used before the connection task runs.
    async fn command(
        &mut self,
        line: &str,
        notices: &mpsc::UnboundedSender<ControlNotice>,
    ) -> Result<Reply> {
        self.write(line).await?;
        loop {
            let raw = self.next_line().await?;
            match self.decoder.push(&raw) {
                Some(Decoded::Reply(reply)) => return Ok(reply),
                Some(Decoded::Async(reply)) => {
                    trace!("Ignoring notification before ready: {}", reply.first_line());
                }
                Some(Decoded::Unparsed(text)) => {
                    let _ = notices.send(ControlNotice::Raw(text));
                }
                None => {}
            }
        }
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        trace!("Sending command: {}", redact(line.trim_end()));
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String> {
        match self.lines.next_segment().await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let text = text.strip_suffix('\r').unwrap_or(&text).to_string();
                trace!("Received line: {}", text);
                Ok(text)
            }
            None => Err(TorLauncherError::ConnectionClosed),
        }
    }

    /// Connection task: owns the stream, the command queue and the subscriptions.
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        cancel: CancellationToken,
        notices: mpsc::UnboundedSender<ControlNotice>,
        state: Arc<watch::Sender<ControlState>>,
    ) {
        let mut queue: VecDeque<Queued> = VecDeque::new();
        let mut in_flight: Option<oneshot::Sender<Result<Reply>>> = None;
        let mut subscribed: BTreeSet<TorControlEvent> = BTreeSet::new();
        let mut subscribers: HashMap<TorControlEvent, Vec<EventSink>> = HashMap::new();

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Stopped,
                request = requests.recv() => {
                    let request = match request {
                        Some(request) => request,
                        None => break Exit::Stopped,
                    };
                    let queued = match request {
                        Request::Command { line, reply } => Queued { line, reply },
                        Request::Subscribe { class, sink, reply } => {
                            subscribed.insert(class);
                            subscribers.entry(class).or_default().push(sink);
                            Queued { line: set_events_command(&subscribed), reply }
                        }
                        Request::Unsubscribe { class, reply } => {
                            subscribed.remove(&class);
                            subscribers.remove(&class);
                            Queued { line: set_events_command(&subscribed), reply }
                        }
                    };
                    queue.push_back(queued);
                }
                raw = self.next_line() => {
                    let raw = match raw {
                        Ok(raw) => raw,
                        Err(e) => break Exit::Failed(e),
                    };
                    match self.decoder.push(&raw) {
                        Some(Decoded::Reply(reply)) => match in_flight.take() {
                            Some(waiter) => {
                                let _ = waiter.send(Ok(reply));
                            }
                            None => {
                                warn!("Reply without outstanding command: {}", reply.first_line());
                                let _ = notices.send(ControlNotice::Raw(reply.text()));
                            }
                        },
                        Some(Decoded::Async(reply)) => match ControlEvent::from_reply(&reply) {
                            Some(event) => dispatch(&mut subscribers, event),
                            None => {
                                let _ = notices.send(ControlNotice::Raw(reply.text()));
                            }
                        },
                        Some(Decoded::Unparsed(text)) => {
                            let _ = notices.send(ControlNotice::Raw(text));
                        }
                        None => {}
                    }
                }
            }

            if in_flight.is_none() {
                if let Some(next) = queue.pop_front() {
                    if let Err(e) = self.write(&next.line).await {
                        let _ = next.reply.send(Err(TorLauncherError::ConnectionClosed));
                        break Exit::Failed(e);
                    }
                    in_flight = Some(next.reply);
                }
            }
        };

        let was_running = *state.borrow() == ControlState::Ready;
        let stopped = matches!(exit, Exit::Stopped);
        let failure = || {
            if stopped {
                TorLauncherError::Cancelled
            } else {
                TorLauncherError::ConnectionClosed
            }
        };

        requests.close();
        while let Ok(request) = requests.try_recv() {
            let reply = match request {
                Request::Command { reply, .. }
                | Request::Subscribe { reply, .. }
                | Request::Unsubscribe { reply, .. } => reply,
            };
            queue.push_back(Queued {
                line: String::new(),
                reply,
            });
        }
        if let Some(waiter) = in_flight.take() {
            let _ = waiter.send(Err(failure()));
        }
        for queued in queue.drain(..) {
            let _ = queued.reply.send(Err(failure()));
        }

        match exit {
            Exit::Stopped => {
                state.send_replace(ControlState::Closed);
            }
            Exit::Failed(e) => {
                state.send_if_modified(|s| {
                    if *s == ControlState::Closed {
                        return false;
                    }
                    *s = ControlState::Disconnected;
                    true
                });
                debug!(error = %e, was_running, "Control connection lost");
                let _ = notices.send(ControlNotice::Closed { was_running });
            }
        }
    }
}

/// Hand an event to every live sink of its class, in arrival order.
fn dispatch(subscribers: &mut HashMap<TorControlEvent, Vec<EventSink>>, event: ControlEvent) {
    match subscribers.get_mut(&event.class) {
        Some(sinks) => sinks.retain(|sink| sink.send(event.clone()).is_ok()),
        None => trace!("No subscriber for {}", event.class),
    }
}

fn set_events_command(classes: &BTreeSet<TorControlEvent>) -> String {
    let names: Vec<&str> = classes.iter().map(|c| c.as_str()).collect();
    format_command("SETEVENTS", &names)
}

fn redact(line: &str) -> &str {
    if line.starts_with("AUTHENTICATE") || line.starts_with("AUTHCHALLENGE") {
        line.split(' ').next().unwrap_or(line)
    } else {
        line
    }
}
