//! The I/O worker: accept threads, I/O threads, and the task pool.
//!
//! Accept threads each own one SO_REUSEPORT listener socket and hand every
//! accepted connection to an I/O thread chosen by the placement hash. I/O
//! threads run the readiness loop in `event_loop`; blocking handler work
//! runs on the task pool. The two tiers are never merged.

use crate::config::WorkerConfig;
use crate::handler::Router;
use crate::metrics::Metrics;
use crate::runtime::event_loop::{self, IoCommand, IoThreadHandle};
use crate::runtime::tasks::{TaskPool, TaskRejected};
use crate::runtime::BufferPool;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// How often accept threads wake to re-check watermarks and shutdown.
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// I/O thread count for a machine with `logical_cores` processing units.
///
/// The placement hash folds the peer's kernel-chosen port into the thread
/// index, and connecting kernels favor even ports. An even thread count
/// would then leave half the threads idle, so even core counts are reduced
/// by one. This is a workaround for the hash bias, not a uniformity
/// guarantee.
pub fn io_threads_for(logical_cores: usize) -> usize {
    if logical_cores % 2 == 0 {
        logical_cores.saturating_sub(1).max(1)
    } else {
        logical_cores
    }
}

/// Pick the I/O thread for a newly accepted connection.
///
/// `(hash(peer address) * 23 + peer port) % io_threads`, the port being the
/// one the peer's kernel selected for the connection.
pub fn placement(peer: &SocketAddr, io_threads: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    peer.ip().hash(&mut hasher);
    let hashed = hasher.finish();
    (hashed
        .wrapping_mul(23)
        .wrapping_add(u64::from(peer.port()))
        % io_threads as u64) as usize
}

/// Shared worker state visible to accept threads and I/O threads.
pub(crate) struct WorkerShared {
    pub shutdown: AtomicBool,
    pub metrics: Arc<Metrics>,
    pub high_water: usize,
    pub low_water: usize,
}

/// Owns the worker's thread sets and the blocking-task pool.
pub struct IoWorker {
    config: WorkerConfig,
    shared: Arc<WorkerShared>,
    io_handles: Vec<IoThreadHandle>,
    io_joins: Vec<JoinHandle<()>>,
    accept_joins: Vec<JoinHandle<()>>,
    tasks: Arc<TaskPool>,
    pool: Arc<BufferPool>,
}

impl IoWorker {
    /// Spawn the I/O threads and the task pool. Accept threads are added
    /// when a listener resumes accepting.
    pub fn start(
        config: WorkerConfig,
        router: Arc<Router>,
        metrics: Arc<Metrics>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> io::Result<Self> {
        let io_count = config.io_thread_count();
        let shared = Arc::new(WorkerShared {
            shutdown: AtomicBool::new(false),
            metrics: Arc::clone(&metrics),
            high_water: config.high_water,
            low_water: config.low_water,
        });
        let pool = Arc::new(BufferPool::new(config.buffer_count, config.buffer_size));
        let tasks = TaskPool::start(
            config.task_core_threads,
            config.task_max_threads,
            config.task_backlog,
        );

        info!(
            io_threads = io_count,
            task_core = config.task_core_threads,
            task_max = config.task_max_threads,
            "starting I/O worker"
        );

        let grace = Duration::from_millis(config.shutdown_timeout_ms);
        let mut io_handles = Vec::with_capacity(io_count);
        let mut io_joins = Vec::with_capacity(io_count);
        for id in 0..io_count {
            let (handle, join) = event_loop::spawn(
                id,
                Arc::clone(&router),
                Arc::clone(&pool),
                Arc::clone(&tasks),
                tls.clone(),
                Arc::clone(&shared),
                grace,
            )?;
            io_handles.push(handle);
            io_joins.push(join);
        }

        Ok(Self {
            config,
            shared,
            io_handles,
            io_joins,
            accept_joins: Vec::new(),
            tasks,
            pool,
        })
    }

    /// Spawn one accept thread per listener socket.
    pub(crate) fn spawn_acceptors(
        &mut self,
        sockets: Vec<std::net::TcpListener>,
    ) -> io::Result<()> {
        for (id, socket) in sockets.into_iter().enumerate() {
            let io_handles = self.io_handles.clone();
            let shared = Arc::clone(&self.shared);
            let nodelay = self.config.tcp_nodelay;
            let cork = self.config.cork;

            let join = thread::Builder::new()
                .name(format!("accept-{id}"))
                .spawn(move || {
                    if let Err(e) = accept_loop(id, socket, io_handles, shared, nodelay, cork) {
                        error!(acceptor = id, error = %e, "accept thread failed");
                    }
                })?;
            self.accept_joins.push(join);
        }
        Ok(())
    }

    /// Enqueue blocking work; fails instead of blocking when the backlog
    /// limit is reached.
    #[allow(dead_code)] // worker surface; the event loop submits through its own pool handle
    pub fn submit_blocking(
        &self,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<(), TaskRejected> {
        self.tasks.submit(task)
    }

    /// Stop accepting, let in-flight exchanges and tasks finish, join
    /// every thread. Bounded by the configured shutdown timeout.
    pub(crate) fn drain(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);

        for join in self.accept_joins.drain(..) {
            let _ = join.join();
        }

        // I/O threads exit once their in-flight exchanges finish (or the
        // grace period lapses); wake them so they notice the flag.
        for handle in &self.io_handles {
            handle.wake();
        }
        for join in self.io_joins.drain(..) {
            let _ = join.join();
        }

        // Queued tasks belong to exchanges that were in flight; let them
        // finish before the pool goes away.
        debug!(
            pending_tasks = self.tasks.pending(),
            task_threads = self.tasks.live_threads(),
            "shutting down task pool"
        );
        self.tasks.shutdown();

        debug!(
            buffers_available = self.pool.available(),
            buffers_leased = self.pool.leased(),
            buffer_overflows = self.pool.overflow_allocations(),
            "worker drained"
        );
    }

    /// Block on the worker's threads without initiating shutdown.
    pub(crate) fn wait(&mut self) {
        for join in self.accept_joins.drain(..) {
            let _ = join.join();
        }
        for join in self.io_joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn accept_loop(
    id: usize,
    socket: std::net::TcpListener,
    io_handles: Vec<IoThreadHandle>,
    shared: Arc<WorkerShared>,
    nodelay: bool,
    cork: bool,
) -> io::Result<()> {
    let mut listener = TcpListener::from_std(socket);
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let io_count = io_handles.len();
    let mut suspended = false;
    debug!(acceptor = id, "accept thread started");

    loop {
        match poll.poll(&mut events, Some(ACCEPT_TICK)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            debug!(acceptor = id, "accept thread stopping");
            return Ok(());
        }

        // Watermark gating: suspend at high water, resume below low water.
        let active = shared.metrics.active_connections() as usize;
        if suspended {
            if active < shared.low_water {
                suspended = false;
                debug!(acceptor = id, active, "resuming accepts");
            } else {
                continue;
            }
        }

        loop {
            if shared.metrics.active_connections() as usize >= shared.high_water {
                suspended = true;
                warn!(acceptor = id, "connection high water reached, suspending accepts");
                break;
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    if nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "failed to set TCP_NODELAY");
                        }
                    }
                    if cork {
                        set_cork(&stream);
                    }

                    let target = placement(&peer, io_count);
                    shared.metrics.connection_opened();
                    debug!(acceptor = id, peer = %peer, io_thread = target, "accepted connection");
                    io_handles[target].send(IoCommand::Register(stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(acceptor = id, error = %e, "accept error");
                    break;
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_cork(stream: &mio::net::TcpStream) {
    use std::os::unix::io::AsRawFd;

    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!("failed to set TCP_CORK");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cork(_stream: &mio::net::TcpStream) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_io_threads_prefer_odd() {
        // Even core counts step down to the next odd count, floor 1.
        for cores in [2usize, 4, 8, 16, 64] {
            assert_eq!(io_threads_for(cores), cores - 1);
        }
        for cores in [1usize, 3, 7, 15] {
            assert_eq!(io_threads_for(cores), cores);
        }
        assert_eq!(io_threads_for(0), 1);
    }

    #[test]
    fn test_placement_in_range() {
        for port in 1024..1124u16 {
            let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), port);
            for n in 1..8 {
                assert!(placement(&peer, n) < n);
            }
        }
    }

    #[test]
    fn test_placement_even_port_bias() {
        // With only even peer ports, an even thread count reaches at most
        // half the threads; an odd count reaches all of them. This is the
        // bias the sizing heuristic works around.
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        let even_ports = (10_000..10_400u16).step_by(2);

        let mut even_count_threads = HashSet::new();
        let mut odd_count_threads = HashSet::new();
        for port in even_ports {
            let peer = SocketAddr::new(ip, port);
            even_count_threads.insert(placement(&peer, 4));
            odd_count_threads.insert(placement(&peer, 3));
        }

        assert!(even_count_threads.len() <= 2);
        assert_eq!(odd_count_threads.len(), 3);
    }

    #[test]
    fn test_placement_stable_per_peer() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let first = placement(&peer, 5);
        for _ in 0..10 {
            assert_eq!(placement(&peer, 5), first);
        }
    }

    #[test]
    fn test_submit_blocking_runs_on_task_pool() {
        let config = WorkerConfig {
            accept_threads: 1,
            read_threads: Some(1),
            write_threads: Some(1),
            task_core_threads: 1,
            task_max_threads: 1,
            task_backlog: 4,
            buffer_count: 8,
            ..WorkerConfig::default()
        };
        let mut worker = IoWorker::start(
            config,
            Arc::new(Router::new()),
            crate::metrics::Metrics::new(),
            None,
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        worker
            .submit_blocking(Box::new(move || {
                tx.send(42u32).unwrap();
            }))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            42
        );

        worker.drain();
    }
}
