//! Bounded pool of task threads for blocking handler work.
//!
//! The pool keeps `core` threads alive for its whole lifetime and grows on
//! demand up to `max` threads; overflow threads retire after sitting idle.
//! The pending queue is a bounded channel sized to the backlog limit, so a
//! submission either enqueues immediately or fails with [`TaskRejected`] —
//! it never blocks the submitting I/O thread.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A unit of blocking work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Submission failed because the backlog limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRejected;

impl fmt::Display for TaskRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task backlog full")
    }
}

impl std::error::Error for TaskRejected {}

/// How long an overflow thread waits for work before retiring.
const OVERFLOW_KEEPALIVE: Duration = Duration::from_secs(30);

struct PoolShared {
    /// Threads currently alive (core + overflow).
    live: AtomicUsize,
    /// Threads waiting for work.
    idle: AtomicUsize,
    max_threads: usize,
}

/// Fixed-backlog pool of blocking-task threads.
pub struct TaskPool {
    tx: Mutex<Option<Sender<Task>>>,
    rx: Receiver<Task>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Start the pool with `core` resident threads, growth up to `max`,
    /// and a pending queue holding at most `backlog` tasks.
    pub fn start(core: usize, max: usize, backlog: usize) -> Arc<Self> {
        debug_assert!(max >= core);
        debug_assert!(max >= 1 && backlog >= 1);

        let (tx, rx) = bounded::<Task>(backlog);
        let pool = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx,
            shared: Arc::new(PoolShared {
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                max_threads: max,
            }),
            handles: Mutex::new(Vec::with_capacity(max)),
        });

        for id in 0..core {
            pool.spawn_worker(id, true);
        }
        pool
    }

    /// Enqueue a blocking task.
    ///
    /// Fails with [`TaskRejected`] when the backlog is full or the pool is
    /// shutting down; never blocks.
    pub fn submit(&self, task: Task) -> Result<(), TaskRejected> {
        {
            let guard = self.tx.lock().unwrap();
            let tx = guard.as_ref().ok_or(TaskRejected)?;
            tx.try_send(task).map_err(|_| TaskRejected)?;
        }

        // Grow when every live thread is busy and the cap allows it. The
        // counters are racy, which at worst spawns one short-lived extra
        // thread or leaves a task queued until a worker frees up.
        let shared = &self.shared;
        if shared.idle.load(Ordering::Acquire) == 0 {
            let live = shared.live.load(Ordering::Acquire);
            if live < shared.max_threads {
                self.spawn_worker(live, false);
            }
        }
        Ok(())
    }

    /// Tasks waiting in the backlog.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Stop accepting work, let queued and running tasks complete, and join
    /// every worker. Running tasks are never interrupted.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                error!("task thread panicked during shutdown");
            }
        }
    }

    fn spawn_worker(&self, id: usize, core: bool) {
        let rx = self.rx.clone();
        let shared = Arc::clone(&self.shared);
        shared.live.fetch_add(1, Ordering::AcqRel);
        shared.idle.fetch_add(1, Ordering::AcqRel);

        let kind = if core { "task" } else { "task-ovf" };
        let spawned = thread::Builder::new()
            .name(format!("{kind}-{id}"))
            .spawn(move || {
                worker_loop(rx, shared, core);
            });

        match spawned {
            Ok(handle) => self.handles.lock().unwrap().push(handle),
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                self.shared.idle.fetch_sub(1, Ordering::AcqRel);
                error!(error = %e, "failed to spawn task thread");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Task>, shared: Arc<PoolShared>, core: bool) {
    loop {
        let task = if core {
            match rx.recv() {
                Ok(task) => task,
                // Channel closed and drained: shutdown.
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(OVERFLOW_KEEPALIVE) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("overflow task thread retiring");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        shared.idle.fetch_sub(1, Ordering::AcqRel);
        task();
        shared.idle.fetch_add(1, Ordering::AcqRel);
    }

    shared.idle.fetch_sub(1, Ordering::AcqRel);
    shared.live.fetch_sub(1, Ordering::AcqRel);
}
