//! Lifecycle notifications.
//!
//! Observers are registered with the supervisor and called on its control
//! task, synchronously and in registration order. Every method has an empty
//! default so an observer only implements what it cares about.

use std::sync::Arc;
use tracing::info;

/// Receives supervisor notifications.
pub trait TorLauncherObserver: Send + Sync + 'static {
    /// The process-start facility itself failed.
    fn on_tor_launcher_crashed(&self) {}

    /// The daemon (or its control connection) went away.
    fn on_tor_crashed(&self, _pid: Option<u32>) {}

    /// A launch attempt finished.
    fn on_tor_launched(&self, _success: bool, _pid: Option<u32>) {}

    /// A proxy URI became available.
    fn on_tor_new_proxy_uri(&self, _uri: &str) {}

    /// Bootstrap progress, verbatim percentage text.
    fn on_tor_initializing(&self, _percentage: &str) {}

    /// A circuit became usable or stopped being usable.
    fn on_tor_circuit_established(&self, _established: bool) {}

    /// Diagnostic text of a control port event.
    fn on_tor_control_event(&self, _event: &str) {}
}

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Registered observers, in registration order.
#[derive(Default)]
pub(crate) struct ObserverList {
    observers: Vec<(ObserverId, Arc<dyn TorLauncherObserver>)>,
}

impl ObserverList {
    pub(crate) fn add(&mut self, id: ObserverId, observer: Arc<dyn TorLauncherObserver>) {
        self.observers.push((id, observer));
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(registered, _)| *registered != id);
        self.observers.len() != before
    }

    /// Call `f` on every observer registered when the dispatch started.
    pub(crate) fn notify(&self, f: impl Fn(&dyn TorLauncherObserver)) {
        let snapshot: Vec<Arc<dyn TorLauncherObserver>> =
            self.observers.iter().map(|(_, o)| o.clone()).collect();
        for observer in &snapshot {
            f(observer.as_ref());
        }
    }
}

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl TorLauncherObserver for LoggingObserver {
    fn on_tor_launcher_crashed(&self) {
        info!("[launcher-crashed]");
    }

    fn on_tor_crashed(&self, pid: Option<u32>) {
        info!(?pid, "[crashed]");
    }

    fn on_tor_launched(&self, success: bool, pid: Option<u32>) {
        info!(success, ?pid, "[launched]");
    }

    fn on_tor_new_proxy_uri(&self, uri: &str) {
        info!(uri, "[proxy]");
    }

    fn on_tor_initializing(&self, percentage: &str) {
        info!(percentage, "[bootstrap]");
    }

    fn on_tor_circuit_established(&self, established: bool) {
        info!(established, "[circuit]");
    }

    fn on_tor_control_event(&self, event: &str) {
        info!(event, "[control]");
    }
}
