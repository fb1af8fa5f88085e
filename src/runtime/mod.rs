//! Two-tier runtime for non-blocking I/O with blocking offload.
//!
//! - `buffer`: shared pool of fixed-size slices for socket I/O
//! - `worker`: accept threads, I/O threads, and sizing/placement logic
//! - `event_loop`: the per-I/O-thread readiness loop and connection
//!   state machine
//! - `tasks`: bounded thread pool for handlers that may block
//!
//! I/O threads only ever park in the poller; anything that can block on an
//! external resource is routed through the task pool and its completion is
//! marshalled back to the connection's own I/O thread.

mod buffer;
pub(crate) mod event_loop;
mod tasks;
pub(crate) mod worker;

pub use buffer::BufferPool;
pub use tasks::{TaskPool, TaskRejected};
pub use worker::{io_threads_for, placement, IoWorker};
