//! Example: Launch and supervise a Tor daemon
//!
//! Starts the given tor binary with data and handshake files under a
//! directory, prints lifecycle notifications and kills the daemon on Ctrl+C.
//!
//! Run with: cargo run --example launch -- /usr/bin/tor /tmp/tor-launch

use std::path::PathBuf;
use std::sync::Arc;
use tor_launcher::{
    LauncherSettings, LoggingObserver, Result, TorConfig, TorLauncher, TorLauncherObserver,
};
use tracing_subscriber::EnvFilter;

struct Printer;

impl TorLauncherObserver for Printer {
    fn on_tor_launched(&self, success: bool, pid: Option<u32>) {
        println!("[LAUNCHED] success={} pid={:?}", success, pid);
    }

    fn on_tor_crashed(&self, pid: Option<u32>) {
        println!("[CRASHED] pid={:?}", pid);
    }

    fn on_tor_new_proxy_uri(&self, uri: &str) {
        println!("[PROXY] {}", uri);
    }

    fn on_tor_initializing(&self, percentage: &str) {
        println!("[BOOTSTRAP] {}%", percentage);
    }

    fn on_tor_circuit_established(&self, established: bool) {
        println!("[CIRCUIT] established={}", established);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let binary = PathBuf::from(args.next().unwrap_or_else(|| "tor".to_string()));
    let base = PathBuf::from(args.next().unwrap_or_else(|| "/tmp/tor-launch".to_string()));

    let launcher = TorLauncher::new(LauncherSettings::new());
    launcher.add_observer(Arc::new(Printer));
    launcher.add_observer(Arc::new(LoggingObserver));

    let config = TorConfig::new(binary, base.join("data"), base.join("watch"));
    launcher.launch_tor_process(config)?;
    println!("Launching... (Ctrl+C to exit)");

    tokio::signal::ctrl_c().await?;

    println!("\nVersion: {}", launcher.tor_version());
    println!("Proxy:   {}", launcher.tor_proxy_uri());
    launcher.kill_tor_process()?;

    match launcher.get_tor_log().await {
        Ok(log) => println!("Log: {} lines", log.lines().count()),
        Err(e) => eprintln!("Failed to read log: {}", e),
    }

    Ok(())
}
