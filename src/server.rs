//! Server lifecycle: start, graceful stop, wait.
//!
//! `Server::start` returns an explicit handle; there is no process-wide
//! server state. Stopping drains the listener per its state machine —
//! accepting stops first, in-flight exchanges get the configured grace
//! period, then everything is joined.

use crate::config::{Config, ConfigError};
use crate::handler::Router;
use crate::listener::{Listener, ListenerState};
use crate::metrics::Metrics;
use crate::runtime::IoWorker;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Startup failures.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    Io(io::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Config(e) => write!(f, "configuration: {e}"),
            StartError::Io(e) => write!(f, "I/O: {e}"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<ConfigError> for StartError {
    fn from(e: ConfigError) -> Self {
        StartError::Config(e)
    }
}

impl From<io::Error> for StartError {
    fn from(e: io::Error) -> Self {
        StartError::Io(e)
    }
}

/// The server entry point.
pub struct Server;

impl Server {
    /// Bind, start accepting, and return the running server's handle.
    pub fn start(config: &Config, router: Router) -> Result<ServerHandle, StartError> {
        config.worker.validate()?;
        let options = config.listener_options()?;

        let metrics = Metrics::new();
        let tls = options.tls_config();
        let mut worker = IoWorker::start(
            config.worker.clone(),
            Arc::new(router),
            Arc::clone(&metrics),
            tls,
        )?;

        let mut listener = Listener::new(options);
        listener.bind(config.worker.reuse_address)?;
        let sockets = listener.resume_accepts();
        worker.spawn_acceptors(sockets)?;

        info!(addr = %listener.local_addr(), "server accepting");
        Ok(ServerHandle {
            listener,
            worker,
            metrics,
        })
    }
}

/// Handle to a running server; the only way to observe or stop it.
pub struct ServerHandle {
    listener: Listener,
    worker: IoWorker,
    metrics: Arc<Metrics>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Graceful drain: stop accepting, let in-flight exchanges finish
    /// (bounded by the shutdown timeout), join all threads.
    pub fn stop(mut self) {
        self.listener.begin_drain();
        info!(
            addr = %self.listener.local_addr(),
            state = ?self.listener.state(),
            active = self.metrics.snapshot().connections_active,
            "server draining"
        );

        self.worker.drain();
        self.listener.mark_closed();

        let snapshot = self.metrics.snapshot();
        info!(
            connections = snapshot.connections_accepted,
            exchanges = snapshot.exchanges_completed,
            rejected = snapshot.tasks_rejected,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            "server stopped"
        );
    }

    /// Block until the server exits (it runs until stopped or killed).
    pub fn wait(mut self) {
        self.worker.wait();
    }
}
