//! gatehouse: an embeddable HTTP(S) server runtime
//!
//! Connections are accepted on a small fixed set of non-blocking I/O
//! threads; handlers that may block run on a separate bounded task pool so
//! the I/O threads never stall.
//!
//! Features:
//! - Plaintext and TLS listeners sharing one lifecycle state machine
//! - Blocking-handler offload with overload rejection (503)
//! - Pooled I/O buffers sliced from region allocations
//! - Protocol upgrade hook for message-framed sub-protocols
//! - Configuration via CLI arguments or TOML file

mod bench;
mod config;
mod error;
mod exchange;
mod handler;
mod http;
mod listener;
mod metrics;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        transport = %config.transport,
        accept_threads = config.worker.accept_threads,
        io_threads = config.worker.io_thread_count(),
        task_max = config.worker.task_max_threads,
        "Starting gatehouse server"
    );

    let handle = Server::start(&config, bench::benchmark_routes())?;
    handle.wait();
    Ok(())
}
