//! Listener lifecycle and transport selection.
//!
//! A listener moves `Unbound → Bound → Accepting → Draining → Closed`.
//! Plaintext and TLS share the state machine; the TLS transport carries a
//! loaded credential context, and constructing TLS options without one is
//! impossible by type. One SO_REUSEPORT socket is bound per accept thread
//! so the kernel load-balances incoming connections across them.

use rustls::pki_types::PrivateKeyDer;
use std::fmt;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Wire transport for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => write!(f, "plain"),
            Transport::Tls => write!(f, "tls"),
        }
    }
}

/// Loaded server credentials for TLS listeners.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ServerConfig>,
}

impl TlsContext {
    /// Load a PEM certificate chain and private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_file = std::fs::File::open(cert_path)
            .map_err(|e| TlsError::FileRead(cert_path.to_path_buf(), e))?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::FileRead(cert_path.to_path_buf(), e))?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
        }

        let key_file = std::fs::File::open(key_path)
            .map_err(|e| TlsError::FileRead(key_path.to_path_buf(), e))?;
        let key: PrivateKeyDer = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| TlsError::FileRead(key_path.to_path_buf(), e))?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::BadCredentials)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn server_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.config)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Credential loading failures.
#[derive(Debug)]
pub enum TlsError {
    FileRead(PathBuf, io::Error),
    NoCertificate(PathBuf),
    NoPrivateKey(PathBuf),
    BadCredentials(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::FileRead(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            TlsError::NoCertificate(path) => {
                write!(f, "no certificate found in '{}'", path.display())
            }
            TlsError::NoPrivateKey(path) => {
                write!(f, "no private key found in '{}'", path.display())
            }
            TlsError::BadCredentials(e) => write!(f, "invalid server credentials: {e}"),
        }
    }
}

impl std::error::Error for TlsError {}

/// Options a listener is bound with.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub bind: SocketAddr,
    pub accept_threads: usize,
    tls: Option<TlsContext>,
}

impl ListenerOptions {
    /// Plaintext listener.
    pub fn plaintext(bind: SocketAddr) -> Self {
        Self {
            bind,
            accept_threads: 1,
            tls: None,
        }
    }

    /// TLS listener. Requires loaded credentials, so a TLS listener without
    /// a valid context cannot be expressed.
    pub fn tls(bind: SocketAddr, context: TlsContext) -> Self {
        Self {
            bind,
            accept_threads: 1,
            tls: Some(context),
        }
    }

    pub fn with_accept_threads(mut self, count: usize) -> Self {
        self.accept_threads = count.max(1);
        self
    }

    pub fn transport(&self) -> Transport {
        if self.tls.is_some() {
            Transport::Tls
        } else {
            Transport::Plain
        }
    }

    pub(crate) fn tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.tls.as_ref().map(|t| t.server_config())
    }
}

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Accepting,
    Draining,
    Closed,
}

/// A bound listener: its sockets plus lifecycle state.
///
/// The accept threads themselves are owned by the I/O worker; this type
/// owns the sockets until accepting starts and tracks the state machine.
#[derive(Debug)]
pub struct Listener {
    options: ListenerOptions,
    local_addr: SocketAddr,
    sockets: Vec<std::net::TcpListener>,
    state: ListenerState,
}

impl Listener {
    /// An unbound listener holding its options.
    pub fn new(options: ListenerOptions) -> Self {
        Self {
            local_addr: options.bind,
            options,
            sockets: Vec::new(),
            state: ListenerState::Unbound,
        }
    }

    /// Bind one socket per accept thread. `Unbound → Bound`.
    pub fn bind(&mut self, reuse_address: bool) -> io::Result<()> {
        debug_assert_eq!(self.state, ListenerState::Unbound);

        // The first socket resolves port 0; the rest must share the
        // resolved port for SO_REUSEPORT balancing to apply.
        let first = bind_socket(self.options.bind, reuse_address)?;
        self.local_addr = first.local_addr()?;
        self.sockets.push(first);
        for _ in 1..self.options.accept_threads {
            self.sockets.push(bind_socket(self.local_addr, reuse_address)?);
        }

        info!(
            addr = %self.local_addr,
            transport = %self.options.transport(),
            accept_threads = self.options.accept_threads,
            "listener bound"
        );

        self.state = ListenerState::Bound;
        Ok(())
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand the bound sockets to the accept threads. `Bound → Accepting`.
    pub(crate) fn resume_accepts(&mut self) -> Vec<std::net::TcpListener> {
        debug_assert_eq!(self.state, ListenerState::Bound);
        self.state = ListenerState::Accepting;
        std::mem::take(&mut self.sockets)
    }

    /// `Accepting → Draining`: stop accepting, in-flight exchanges finish.
    pub(crate) fn begin_drain(&mut self) {
        self.state = ListenerState::Draining;
    }

    /// `Draining → Closed`.
    pub(crate) fn mark_closed(&mut self) {
        self.state = ListenerState::Closed;
    }
}

/// Nonblocking SO_REUSEPORT listener socket.
fn bind_socket(addr: SocketAddr, reuse_address: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(reuse_address)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_assigns_port_and_state() {
        let options =
            ListenerOptions::plaintext("127.0.0.1:0".parse().unwrap()).with_accept_threads(2);
        let mut listener = Listener::new(options);
        assert_eq!(listener.state(), ListenerState::Unbound);

        listener.bind(true).unwrap();
        assert_eq!(listener.state(), ListenerState::Bound);
        assert_ne!(listener.local_addr().port(), 0);

        let sockets = listener.resume_accepts();
        assert_eq!(sockets.len(), 2);
        assert_eq!(listener.state(), ListenerState::Accepting);
        for socket in &sockets {
            assert_eq!(socket.local_addr().unwrap(), listener.local_addr());
        }

        listener.begin_drain();
        assert_eq!(listener.state(), ListenerState::Draining);
        listener.mark_closed();
        assert_eq!(listener.state(), ListenerState::Closed);
    }

    #[test]
    fn test_tls_requires_credentials() {
        let missing = TlsContext::load(
            Path::new("testdata/does-not-exist.pem"),
            Path::new("testdata/key.pem"),
        );
        assert!(matches!(missing, Err(TlsError::FileRead(_, _))));

        // A cert file with no certificate in it is rejected before bind.
        let empty = tempfile_with(b"not a pem\n");
        let bad = TlsContext::load(&empty, Path::new("testdata/key.pem"));
        assert!(matches!(bad, Err(TlsError::NoCertificate(_))));
    }

    #[test]
    fn test_tls_context_loads_test_credentials() {
        let ctx = TlsContext::load(Path::new("testdata/cert.pem"), Path::new("testdata/key.pem"))
            .unwrap();
        let options = ListenerOptions::tls("127.0.0.1:0".parse().unwrap(), ctx);
        assert_eq!(options.transport(), Transport::Tls);
        assert!(options.tls_config().is_some());
    }

    fn tempfile_with(contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gatehouse-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }
}
