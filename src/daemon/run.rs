//! Daemon runner: bind, dispatch, sweep, and wait for a signal.
//!
//! This never returns on success until SIGHUP/SIGINT/SIGTERM/SIGQUIT.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use thiserror::Error;

use super::Daemon;
use crate::config::{Config, ConfigError};
use crate::core::HostId;
use crate::net::{TcpTransport, Transport, TransportError};
use crate::storage::{SqliteMap, StorageError};

const RECV_POLL: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Run one replica under `host`'s identity until a shutdown signal.
pub fn run(config: &Config, host: HostId) -> Result<(), DaemonError> {
    let addrs = config.cluster.address_table()?;
    let store = Arc::new(SqliteMap::open(&config.storage.db_path(host))?);
    let transport = Arc::new(TcpTransport::start(host, addrs)?);
    let daemon = Arc::new(Daemon::new(host, transport.clone(), store));

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    let mut workers = Vec::new();
    for i in 0..config.daemon.workers.max(1) {
        let daemon = Arc::clone(&daemon);
        let transport = Arc::clone(&transport);
        let shutdown = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name(format!("dispatch-{i}"))
            .spawn(move || run_dispatch_loop(&daemon, transport.as_ref(), &shutdown))?;
        workers.push(worker);
    }

    let sweeper = {
        let daemon = Arc::clone(&daemon);
        let shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_millis(config.daemon.redrive_interval_ms.max(1));
        thread::Builder::new()
            .name("sweeper".into())
            .spawn(move || run_sweep_loop(&daemon, interval, &shutdown))?
    };

    tracing::info!(host = %host, addr = %transport.local_addr(), "replica running");
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(SHUTDOWN_POLL);
    }

    tracing::info!(host = %host, "shutting down");
    transport.stop();
    for worker in workers {
        let _ = worker.join();
    }
    let _ = sweeper.join();
    Ok(())
}

/// Pull inbound messages and route them. Several of these run in parallel;
/// per-key serialization is the write machine's lock, not ours.
fn run_dispatch_loop(daemon: &Daemon, transport: &dyn Transport, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match transport.recv_timeout(RECV_POLL) {
            Ok(Some(envelope)) => daemon.dispatch(envelope.from, &envelope.payload),
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "transport recv failed");
            }
        }
    }
}

/// Re-drive stalled rounds and reap idle machines. Without this a lost
/// message would stall its key until the next client write.
fn run_sweep_loop(daemon: &Daemon, interval: Duration, shutdown: &AtomicBool) {
    let mut last = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(SHUTDOWN_POLL.min(interval));
        if last.elapsed() >= interval {
            daemon.sweep();
            last = Instant::now();
        }
    }
}
