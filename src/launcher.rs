//! Process supervisor.
//!
//! [`TorLauncher`] is a cheap, cloneable handle to a supervisor task. The
//! task owns all lifecycle state: the launch configuration, the
//! [`ProcessRecord`], the observer registry, and the watcher and control
//! client of the current epoch. Every asynchronous step (process start,
//! handshake polling, control replies) runs in its own task and reports back
//! to the supervisor with the epoch it was started in; completions from an
//! epoch that has since been torn down are dropped.
//!
//! ```text
//! launch ─► process started ─► watch handshake ─► control start ─► ready
//!   ▲            │ fail             │ exhausted        │ fail         │
//!   │            ▼                  └──► watch again ◄─┘              │
//!   └─ delay ◄─ crash (process exit, launcher failure, control lost) ◄┘
//! ```

use crate::auth::Credential;
use crate::config::{LauncherSettings, TorConfig};
use crate::connection::{ControlNotice, TorControl};
use crate::error::{Result, TorLauncherError};
use crate::events::{ControlEvent, Event, StatusClient, TorControlEvent};
use crate::observer::{ObserverId, ObserverList, TorLauncherObserver};
use crate::process::{DaemonLauncher, DaemonProcess, TorProcessLauncher};
use crate::types::{proxy_uri_from_listener, ProcessRecord};
use crate::watcher::{HandshakeWatcher, WatchOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requests from handles to the supervisor task.
enum Request {
    Launch(TorConfig),
    Kill,
    AddObserver(ObserverId, Arc<dyn TorLauncherObserver>),
    RemoveObserver(ObserverId),
    GetLog(oneshot::Sender<Result<String>>),
}

/// Results of asynchronous steps, tagged with the epoch that started them.
enum Completion {
    Launched {
        epoch: u64,
        result: Result<Option<u32>>,
    },
    LauncherCrashed {
        epoch: u64,
    },
    Exited {
        epoch: u64,
        pid: Option<u32>,
        code: Option<i32>,
    },
    Handshake {
        epoch: u64,
        pid: Option<u32>,
        outcome: WatchOutcome,
    },
    ControlStarted {
        epoch: u64,
        result: Result<()>,
    },
    Notice {
        epoch: u64,
        notice: ControlNotice,
    },
    Event {
        epoch: u64,
        event: ControlEvent,
    },
    /// A query reply, as `Event::VersionReply` or `Event::ListenersReply`.
    Reply {
        epoch: u64,
        result: Result<Event>,
    },
    Relaunch {
        epoch: u64,
    },
}

/// Handle to the daemon supervisor.
///
/// Accessors read a snapshot published by the supervisor task and never
/// block. Dropping the last handle shuts the supervisor down and kills the
/// daemon.
#[derive(Clone)]
pub struct TorLauncher {
    requests: mpsc::UnboundedSender<Request>,
    record: watch::Receiver<ProcessRecord>,
    next_observer: Arc<AtomicU64>,
}

impl TorLauncher {
    /// Start a supervisor that launches the daemon as a child process.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(settings: LauncherSettings) -> Self {
        Self::with_launcher(Arc::new(TorProcessLauncher::new()), settings)
    }

    /// Start a supervisor using a custom process-start facility.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_launcher(launcher: Arc<dyn DaemonLauncher>, settings: LauncherSettings) -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (publish, record) = watch::channel(ProcessRecord::default());

        let supervisor = Supervisor {
            launcher,
            settings,
            config: None,
            record: ProcessRecord::default(),
            publish,
            observers: ObserverList::default(),
            epoch: 0,
            epoch_cancel: CancellationToken::new(),
            launched_at: None,
            control: None,
            relaunch_pending: false,
            completions,
        };
        tokio::spawn(supervisor.run(requests_rx, completions_rx));

        Self {
            requests,
            record,
            next_observer: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Launch the daemon with `config`.
    ///
    /// A launch while the daemon is starting or running is ignored with a
    /// warning. Configurations with an empty path are rejected.
    pub fn launch_tor_process(&self, config: TorConfig) -> Result<()> {
        config.validate()?;
        self.send(Request::Launch(config))
    }

    /// Shut the daemon down and stop the control client. Idempotent.
    pub fn kill_tor_process(&self) -> Result<()> {
        self.send(Request::Kill)
    }

    /// Process id of the running daemon.
    pub fn tor_pid(&self) -> Option<u32> {
        self.record.borrow().pid
    }

    /// Whether the daemon reported an established circuit.
    pub fn is_tor_connected(&self) -> bool {
        self.record.borrow().connected
    }

    /// Proxy URI, empty until the daemon reported its SOCKS listeners.
    pub fn tor_proxy_uri(&self) -> String {
        self.record.borrow().proxy_uri.clone()
    }

    /// Daemon version, empty until known.
    pub fn tor_version(&self) -> String {
        self.record.borrow().version.clone()
    }

    /// Snapshot of the whole process record.
    pub fn record(&self) -> ProcessRecord {
        self.record.borrow().clone()
    }

    /// Receiver that observes every process record change.
    pub fn watch_record(&self) -> watch::Receiver<ProcessRecord> {
        self.record.clone()
    }

    /// Read the daemon log file.
    pub async fn get_tor_log(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetLog(reply))?;
        rx.await.unwrap_or(Err(TorLauncherError::Cancelled))
    }

    /// Register an observer; notifications arrive in registration order.
    pub fn add_observer(&self, observer: Arc<dyn TorLauncherObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        if self.send(Request::AddObserver(id, observer)).is_err() {
            debug!("Observer added after supervisor shutdown");
        }
        id
    }

    /// Unregister an observer. Safe to call from inside a notification.
    pub fn remove_observer(&self, id: ObserverId) {
        if self.send(Request::RemoveObserver(id)).is_err() {
            debug!("Observer removed after supervisor shutdown");
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| TorLauncherError::InvalidState("supervisor has shut down".to_string()))
    }
}

/// State owned by the supervisor task.
struct Supervisor {
    launcher: Arc<dyn DaemonLauncher>,
    settings: LauncherSettings,
    config: Option<TorConfig>,
    record: ProcessRecord,
    publish: watch::Sender<ProcessRecord>,
    observers: ObserverList,
    epoch: u64,
    epoch_cancel: CancellationToken,
    launched_at: Option<SystemTime>,
    control: Option<TorControl>,
    relaunch_pending: bool,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
            }
        }

        self.kill_internal();
        debug!("Supervisor stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Launch(config) => self.launch(config),
            Request::Kill => {
                info!("Killing daemon");
                self.relaunch_pending = false;
                self.record.starting = false;
                self.kill_internal();
            }
            Request::AddObserver(id, observer) => self.observers.add(id, observer),
            Request::RemoveObserver(id) => {
                if !self.observers.remove(id) {
                    debug!(?id, "Removing unknown observer");
                }
            }
            Request::GetLog(reply) => self.get_log(reply),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Launched { epoch, result } if self.is_current(epoch) => {
                self.on_launched(result)
            }
            Completion::LauncherCrashed { epoch } if self.is_current(epoch) => {
                info!("Launcher crashed");
                self.observers.notify(|o| o.on_tor_launcher_crashed());
                self.delayed_relaunch();
            }
            Completion::Exited { epoch, pid, code } if self.is_current(epoch) => {
                info!(?pid, ?code, "Daemon crashed");
                self.observers.notify(|o| o.on_tor_crashed(pid));
                self.delayed_relaunch();
            }
            Completion::Handshake {
                epoch,
                pid,
                outcome,
            } if self.is_current(epoch) => self.on_handshake(pid, outcome),
            Completion::ControlStarted { epoch, result } if self.is_current(epoch) => {
                self.on_control_started(result)
            }
            Completion::Notice { epoch, notice } if self.is_current(epoch) => {
                self.on_notice(notice)
            }
            Completion::Event { epoch, event } if self.is_current(epoch) => self.on_event(event),
            Completion::Reply { epoch, result } if self.is_current(epoch) => match result {
                Ok(Event::VersionReply(version)) => {
                    debug!(%version, "Daemon version");
                    self.record.version = version;
                    self.publish();
                }
                Ok(Event::ListenersReply(listeners)) => self.on_listeners(listeners),
                Ok(other) => debug!(?other, "Unexpected reply"),
                Err(e) => debug!(error = %e, "Query failed"),
            },
            Completion::Relaunch { epoch } if self.is_current(epoch) => self.relaunch(),
            _ => debug!("Dropping completion from a previous epoch"),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    fn publish(&self) {
        self.publish.send_replace(self.record.clone());
    }

    fn launch(&mut self, config: TorConfig) {
        if self.record.starting {
            warn!("Daemon is already starting");
            return;
        }
        if let Some(pid) = self.record.pid {
            warn!(pid, "Daemon is already running");
            return;
        }
        if self.relaunch_pending {
            warn!("Daemon relaunch is already scheduled");
            return;
        }

        self.config = Some(config);
        self.record.starting = true;
        self.publish();
        self.launch_internal();
    }

    /// Start the daemon in the current epoch.
    fn launch_internal(&mut self) {
        let config = match &self.config {
            Some(config) => config.clone(),
            None => {
                self.record.starting = false;
                self.publish();
                return;
            }
        };

        let epoch = self.epoch;
        let cancel = self.epoch_cancel.clone();
        let launcher = self.launcher.clone();
        let completions = self.completions.clone();
        self.launched_at = Some(SystemTime::now());

        debug!(epoch, binary = %config.binary_path.display(), "Launching daemon");
        tokio::spawn(async move {
            let launched = tokio::select! {
                launched = launcher.launch(&config) => launched,
                _ = cancel.cancelled() => return,
            };

            match launched {
                Ok(process) => {
                    let pid = process.id();
                    let _ = completions.send(Completion::Launched {
                        epoch,
                        result: Ok(pid),
                    });
                    monitor(process, epoch, pid, cancel, completions).await;
                }
                Err(e) => {
                    let _ = completions.send(Completion::Launched {
                        epoch,
                        result: Err(e),
                    });
                }
            }
        });
    }

    fn on_launched(&mut self, result: Result<Option<u32>>) {
        match result {
            Ok(pid) => {
                info!(?pid, "Daemon launched");
                self.observers.notify(|o| o.on_tor_launched(true, pid));
                self.record.starting = false;
                self.record.connected = false;
                self.record.pid = pid;
                self.publish();
                self.start_watch(pid, Duration::ZERO);
            }
            Err(e) => {
                error!(error = %e, "Daemon launch failed");
                self.observers.notify(|o| o.on_tor_launched(false, None));
                self.delayed_relaunch();
            }
        }
    }

    /// Watch for the handshake after `delay`, so retries keep the watch interval.
    fn start_watch(&mut self, pid: Option<u32>, delay: Duration) {
        let config = match &self.config {
            Some(config) => config,
            None => return,
        };
        let not_before = self
            .launched_at
            .and_then(|t| t.checked_sub(self.settings.mtime_slack));
        let watcher = HandshakeWatcher::from_settings(&config.tor_watch_path, &self.settings)
            .not_before(not_before);

        let epoch = self.epoch;
        let cancel = self.epoch_cancel.child_token();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let outcome = watcher.watch(cancel).await;
            let _ = completions.send(Completion::Handshake {
                epoch,
                pid,
                outcome,
            });
        });
    }

    fn on_handshake(&mut self, pid: Option<u32>, outcome: WatchOutcome) {
        if pid != self.record.pid {
            debug!(?pid, current = ?self.record.pid, "Handshake pid mismatched");
            return;
        }
        match outcome {
            WatchOutcome::Ready(credential) => self.start_control(credential),
            WatchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                debug!(
                    attempts,
                    error = ?last_error.map(|e| e.to_string()),
                    "Handshake not ready, watching again"
                );
                self.start_watch(pid, self.settings.watch_interval);
            }
            WatchOutcome::Cancelled => {}
        }
    }

    fn start_control(&mut self, credential: Credential) {
        let epoch = self.epoch;
        let (notices, notices_rx) = mpsc::unbounded_channel();
        forward(notices_rx, self.completions.clone(), move |notice| {
            Completion::Notice { epoch, notice }
        });

        let mut control = TorControl::new(&self.settings, notices);
        let started = control.start(credential.cookie, credential.port);
        if let Some(mut previous) = self.control.replace(control) {
            previous.stop();
        }

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = started.await;
            let _ = completions.send(Completion::ControlStarted { epoch, result });
        });
    }

    fn on_control_started(&mut self, result: Result<()>) {
        if let Err(e) = result {
            warn!(error = %e, "Control connection failed, watching again");
            if let Some(mut control) = self.control.take() {
                control.stop();
            }
            let pid = self.record.pid;
            self.start_watch(pid, self.settings.watch_interval);
            return;
        }

        let control = match &self.control {
            Some(control) => control,
            None => return,
        };
        debug!("Control connection ready");

        let epoch = self.epoch;
        let version = control.get_version();
        let listeners = control.get_socks_listeners();

        let (sink, events) = mpsc::unbounded_channel();
        forward(events, self.completions.clone(), move |event| Completion::Event {
            epoch,
            event,
        });
        let subscriptions: Vec<_> = TorControlEvent::ALL
            .iter()
            .map(|&class| (class, control.subscribe(class, sink.clone())))
            .collect();

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = version.await.map(Event::VersionReply);
            let _ = completions.send(Completion::Reply { epoch, result });
            let result = listeners.await.map(Event::ListenersReply);
            let _ = completions.send(Completion::Reply { epoch, result });
            for (class, subscribed) in subscriptions {
                if let Err(e) = subscribed.await {
                    debug!(%class, error = %e, "Subscription failed");
                }
            }
        });
    }

    fn on_listeners(&mut self, listeners: Vec<String>) {
        debug!(?listeners, "SOCKS listeners");

        let uri = match listeners.first() {
            Some(first) => proxy_uri_from_listener(first),
            None => {
                warn!("Daemon reported no SOCKS listeners");
                return;
            }
        };
        self.record.proxy_uri = uri.clone();
        self.publish();
        self.observers.notify(|o| o.on_tor_new_proxy_uri(&uri));
    }

    fn on_notice(&mut self, notice: ControlNotice) {
        match notice {
            ControlNotice::Raw(text) => {
                self.observers.notify(|o| o.on_tor_control_event(&text));
            }
            ControlNotice::Closed { was_running } => {
                if was_running && self.record.is_running() {
                    let pid = self.record.pid;
                    info!(?pid, "Control connection lost");
                    self.observers.notify(|o| o.on_tor_crashed(pid));
                    self.delayed_relaunch();
                } else {
                    debug!(was_running, "Control connection closed");
                    self.control = None;
                }
            }
        }
    }

    fn on_event(&mut self, event: ControlEvent) {
        let raw = event.to_string();
        debug!(event = %raw, "Control event");
        self.observers.notify(|o| o.on_tor_control_event(&raw));

        match event.decode() {
            Event::StatusClient(StatusClient::BootstrapProgress(percentage)) => {
                self.observers.notify(|o| o.on_tor_initializing(&percentage));
            }
            Event::StatusClient(StatusClient::CircuitEstablished(established)) => {
                self.observers
                    .notify(|o| o.on_tor_circuit_established(established));
                self.record.connected = established;
                self.publish();
            }
            Event::NetworkLiveness(up) => debug!(up, "Network liveness"),
            _ => {}
        }
    }

    /// Tear the epoch down and schedule one relaunch.
    fn delayed_relaunch(&mut self) {
        if self.relaunch_pending {
            debug!("Relaunch already scheduled");
            return;
        }
        self.record.starting = false;
        self.kill_internal();
        self.relaunch_pending = true;

        let epoch = self.epoch;
        let delay = self.settings.relaunch_delay;
        let completions = self.completions.clone();
        debug!(?delay, "Scheduling relaunch");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.send(Completion::Relaunch { epoch });
        });
    }

    fn relaunch(&mut self) {
        self.relaunch_pending = false;
        if self.config.is_none() {
            return;
        }
        info!("Relaunching daemon");
        self.record.starting = true;
        self.publish();
        self.launch_internal();
    }

    /// Stop everything of the current epoch and start a new one.
    fn kill_internal(&mut self) {
        self.epoch_cancel.cancel();
        if let Some(mut control) = self.control.take() {
            control.stop();
        }
        self.record.pid = None;
        self.record.connected = false;
        self.publish();

        self.epoch += 1;
        self.epoch_cancel = CancellationToken::new();
    }

    fn get_log(&self, reply: oneshot::Sender<Result<String>>) {
        let path = match &self.config {
            Some(config) => config.log_path(),
            None => {
                let _ = reply.send(Err(TorLauncherError::Configuration(
                    "no launch configuration".to_string(),
                )));
                return;
            }
        };
        tokio::spawn(async move {
            let result = tokio::fs::read_to_string(&path).await.map_err(Into::into);
            let _ = reply.send(result);
        });
    }
}

/// Watch the process until it exits or the epoch is cancelled.
async fn monitor(
    mut process: Box<dyn DaemonProcess>,
    epoch: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let exited = tokio::select! {
        exited = process.wait() => exited,
        _ = cancel.cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(?pid, error = %e, "Failed to kill daemon");
            }
            return;
        }
    };

    let completion = match exited {
        Ok(code) => Completion::Exited { epoch, pid, code },
        Err(e) => {
            warn!(?pid, error = %e, "Lost track of daemon process");
            Completion::LauncherCrashed { epoch }
        }
    };
    let _ = completions.send(completion);
}

fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    completions: mpsc::UnboundedSender<Completion>,
    wrap: impl Fn(T) -> Completion + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if completions.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}
