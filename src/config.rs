//! Configuration for the gatehouse server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::listener::{ListenerOptions, TlsContext, TlsError, Transport};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(version = "0.1.0")]
#[command(about = "An embeddable HTTP(S) server runtime", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7777)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listener transport: plain or tls
    #[arg(short = 't', long)]
    pub transport: Option<String>,

    /// PEM certificate chain for TLS listeners
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS listeners
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listener transport: "plain" or "tls"
    #[serde(default = "default_transport")]
    pub transport: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            transport: default_transport(),
        }
    }
}

/// Thread, watermark, and socket options for the I/O worker.
///
/// Immutable once the worker starts: the worker takes its own copy and
/// nothing reads this struct afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Accept threads (one SO_REUSEPORT socket each).
    pub accept_threads: usize,
    /// Read-side I/O threads. When either read or write count is unset,
    /// the combined I/O thread count comes from the core-parity heuristic.
    pub read_threads: Option<usize>,
    /// Write-side I/O threads.
    pub write_threads: Option<usize>,
    /// Task threads kept alive for the pool's whole lifetime.
    pub task_core_threads: usize,
    /// Upper bound on task threads.
    pub task_max_threads: usize,
    /// Pending blocking tasks accepted before submissions are rejected.
    pub task_backlog: usize,
    /// Suspend accepting at this many open connections.
    pub high_water: usize,
    /// Resume accepting below this many open connections.
    pub low_water: usize,
    /// TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// TCP_CORK on accepted connections (Linux).
    pub cork: bool,
    /// SO_REUSEADDR on listener sockets.
    pub reuse_address: bool,
    /// Buffer-pool slice count.
    pub buffer_count: usize,
    /// Buffer-pool slice size in bytes.
    pub buffer_size: usize,
    /// Milliseconds granted to in-flight exchanges during drain.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            accept_threads: 4,
            read_threads: None,
            write_threads: None,
            task_core_threads: 10,
            task_max_threads: 12,
            task_backlog: 256,
            high_water: 1_000_000,
            low_water: 1_000_000,
            tcp_nodelay: true,
            cork: false,
            reuse_address: true,
            buffer_count: 1024,
            buffer_size: 8192,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidWorker(reason.into()))
        }

        if self.accept_threads < 1 {
            return invalid("accept_threads must be >= 1");
        }
        if matches!(self.read_threads, Some(0)) || matches!(self.write_threads, Some(0)) {
            return invalid("read_threads and write_threads must be >= 1 when set");
        }
        if self.task_max_threads < self.task_core_threads {
            return invalid("task_max_threads must be >= task_core_threads");
        }
        if self.task_max_threads < 1 {
            return invalid("task_max_threads must be >= 1");
        }
        if self.task_backlog < 1 {
            return invalid("task_backlog must be >= 1");
        }
        if self.low_water < 1 || self.high_water < self.low_water {
            return invalid("watermarks must satisfy high_water >= low_water >= 1");
        }
        if self.buffer_count < 1 || self.buffer_size < 1 {
            return invalid("buffer pool dimensions must be nonzero");
        }
        Ok(())
    }

    /// Combined I/O thread count.
    ///
    /// Explicit read + write counts are honored as given; otherwise the
    /// count comes from the core-parity heuristic.
    pub fn io_thread_count(&self) -> usize {
        match (self.read_threads, self.write_threads) {
            (Some(read), Some(write)) => read + write,
            _ => crate::runtime::io_threads_for(available_cores()),
        }
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// TLS credential paths
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_transport() -> String {
    "plain".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub transport: Transport,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let transport = parse_transport(
            cli.transport
                .as_deref()
                .unwrap_or(&toml_config.server.transport),
        )?;

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            transport,
            tls_cert: cli.tls_cert.or(toml_config.tls.cert),
            tls_key: cli.tls_key.or(toml_config.tls.key),
            worker: toml_config.worker,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.worker.validate()?;
        Ok(config)
    }

    /// Resolve the listener options, loading TLS credentials when needed.
    pub fn listener_options(&self) -> Result<ListenerOptions, ConfigError> {
        let bind: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;

        let options = match self.transport {
            Transport::Plain => ListenerOptions::plaintext(bind),
            Transport::Tls => {
                let (cert, key) = match (&self.tls_cert, &self.tls_key) {
                    (Some(cert), Some(key)) => (cert, key),
                    _ => return Err(ConfigError::MissingTlsCredentials),
                };
                let context = TlsContext::load(cert, key).map_err(ConfigError::Tls)?;
                ListenerOptions::tls(bind, context)
            }
        };

        Ok(options.with_accept_threads(self.worker.accept_threads))
    }
}

fn parse_transport(raw: &str) -> Result<Transport, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "plain" | "http" => Ok(Transport::Plain),
        "tls" | "https" => Ok(Transport::Tls),
        other => Err(ConfigError::InvalidTransport(other.to_string())),
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidTransport(String),
    InvalidWorker(String),
    MissingTlsCredentials,
    Tls(TlsError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => write!(f, "Invalid listen address '{addr}'"),
            ConfigError::InvalidTransport(t) => {
                write!(f, "Invalid transport '{t}' (expected 'plain' or 'tls')")
            }
            ConfigError::InvalidWorker(reason) => write!(f, "Invalid worker config: {reason}"),
            ConfigError::MissingTlsCredentials => {
                write!(f, "TLS transport requires tls_cert and tls_key")
            }
            ConfigError::Tls(e) => write!(f, "TLS credentials: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7777");
        assert_eq!(config.server.transport, "plain");
        assert_eq!(config.worker.accept_threads, 4);
        assert_eq!(config.worker.task_core_threads, 10);
        assert_eq!(config.worker.task_max_threads, 12);
        assert!(config.worker.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:4433"
            transport = "tls"

            [worker]
            accept_threads = 2
            read_threads = 4
            write_threads = 4
            task_core_threads = 8
            task_max_threads = 16
            task_backlog = 32
            high_water = 10000
            low_water = 9000
            cork = true

            [tls]
            cert = "testdata/cert.pem"
            key = "testdata/key.pem"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4433");
        assert_eq!(config.server.transport, "tls");
        assert_eq!(config.worker.read_threads, Some(4));
        assert_eq!(config.worker.io_thread_count(), 8);
        assert_eq!(config.worker.task_backlog, 32);
        assert!(config.worker.cork);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.tls.cert, Some(PathBuf::from("testdata/cert.pem")));
    }

    #[test]
    fn test_cli_precedence() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:9999".to_string()),
            transport: Some("plain".to_string()),
            tls_cert: None,
            tls_key: None,
            log_level: "warn".to_string(),
        };
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.transport, Transport::Plain);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_worker_invariants() {
        let mut worker = WorkerConfig::default();
        assert!(worker.validate().is_ok());

        worker.task_max_threads = worker.task_core_threads - 1;
        assert!(worker.validate().is_err());

        let mut worker = WorkerConfig {
            accept_threads: 0,
            ..WorkerConfig::default()
        };
        assert!(worker.validate().is_err());
        worker.accept_threads = 1;
        worker.low_water = 10;
        worker.high_water = 5;
        assert!(worker.validate().is_err());
    }

    #[test]
    fn test_invalid_transport_rejected() {
        let cli = CliArgs {
            config: None,
            listen: None,
            transport: Some("quic".to_string()),
            tls_cert: None,
            tls_key: None,
            log_level: "info".to_string(),
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidTransport(_))
        ));
    }

    #[test]
    fn test_tls_requires_credential_paths() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:0".to_string()),
            transport: Some("tls".to_string()),
            tls_cert: None,
            tls_key: None,
            log_level: "info".to_string(),
        };
        let config = Config::from_args(cli).unwrap();
        assert!(matches!(
            config.listener_options(),
            Err(ConfigError::MissingTlsCredentials)
        ));
    }
}
