//! Per-I/O-thread readiness loop.
//!
//! Each I/O thread owns a mio poll, a slab of connections, and an intake
//! channel. Accept threads push new connections through the channel; task
//! threads push completed exchanges back the same way. Every socket is
//! registered once for read and write interest, and all I/O is driven to
//! `WouldBlock`, so the loop only ever parks inside `Poll::poll`.
//!
//! A connection is owned by exactly one I/O thread for its whole life.
//! The only state that leaves the thread is the owned `Exchange` of a
//! blocking dispatch, and it comes back over the intake channel — task
//! threads never touch the socket.

use crate::error::{DispatchError, HandlerError};
use crate::exchange::Exchange;
use crate::handler::{FrameHandler, Handler, Router};
use crate::http::{self, BodyFraming, ChunkedDecoder, HeadParse, RequestHead, ResponseHead};
use crate::runtime::buffer::BufferPool;
use crate::runtime::tasks::TaskPool;
use crate::runtime::worker::WorkerShared;
use bytes::{Buf, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Largest request body accepted into memory.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Poll timeout while running; short enough to notice a drain promptly.
const POLL_TICK: Duration = Duration::from_millis(200);

/// Work delivered to an I/O thread over its intake channel.
pub(crate) enum IoCommand {
    /// A freshly accepted connection.
    Register(TcpStream, SocketAddr),
    /// A blocking dispatch finished on a task thread.
    Complete {
        conn_id: usize,
        generation: u64,
        exchange: Exchange,
        result: Result<(), HandlerError>,
    },
}

/// Cloneable address of one I/O thread.
#[derive(Clone)]
pub(crate) struct IoThreadHandle {
    tx: Sender<IoCommand>,
    waker: Arc<Waker>,
}

impl IoThreadHandle {
    pub(crate) fn send(&self, command: IoCommand) {
        // A send can only fail after the thread exited; the connection or
        // completion is dropped with it.
        let _ = self.tx.send(command);
        let _ = self.waker.wake();
    }

    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Spawn one I/O thread; returns its handle and join handle.
pub(crate) fn spawn(
    id: usize,
    router: Arc<Router>,
    pool: Arc<BufferPool>,
    tasks: Arc<TaskPool>,
    tls: Option<Arc<rustls::ServerConfig>>,
    shared: Arc<WorkerShared>,
    drain_grace: Duration,
) -> io::Result<(IoThreadHandle, JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (tx, rx) = unbounded();
    let handle = IoThreadHandle {
        tx,
        waker: Arc::clone(&waker),
    };

    let thread_handle = handle.clone();
    let join = std::thread::Builder::new()
        .name(format!("io-{id}"))
        .spawn(move || {
            let mut event_loop = EventLoop {
                id,
                poll,
                conns: Slab::new(),
                rx,
                handle: thread_handle,
                router,
                pool,
                tasks,
                tls,
                shared,
                drain_grace,
                drain_deadline: None,
                next_generation: 0,
            };
            if let Err(e) = event_loop.run() {
                error!(io_thread = id, error = %e, "I/O thread failed");
            }
        })?;

    Ok((handle, join))
}

/// Connection lifecycle within its I/O thread.
enum ConnState {
    /// TLS handshake in progress; no byte has reached the HTTP parser.
    Handshaking,
    /// Accumulating request-head bytes.
    ReadingHead,
    /// Head parsed; accumulating the body.
    ReadingBody {
        head: RequestHead,
        reader: BodyReader,
        body: BytesMut,
    },
    /// Exchange handed to the task pool; reads stay paused so responses
    /// come back in request order.
    InFlight,
    /// Flushing a response.
    Writing {
        buf: BytesMut,
        written: usize,
        after: AfterWrite,
        is_exchange: bool,
    },
    /// Past a 101: raw bytes go to the installed frame handler.
    Upgraded { proto: Box<dyn FrameHandler> },
    /// Transient placeholder while ownership moves between states.
    Closing,
}

enum BodyReader {
    Length { remaining: usize },
    Chunked(ChunkedDecoder),
}

enum AfterWrite {
    KeepAlive,
    Close,
    Upgrade(Box<dyn FrameHandler>),
}

struct Conn {
    stream: TcpStream,
    tls: Option<rustls::ServerConnection>,
    peer: SocketAddr,
    generation: u64,
    state: ConnState,
    /// Unparsed input; a buffer-pool lease for the connection's lifetime.
    read_buf: BytesMut,
    req_keep_alive: bool,
}

/// Outcome of one state-machine step.
enum Step {
    /// State changed; run the machine again.
    Again,
    /// Nothing to do until the next readiness event.
    Idle,
    /// Tear the connection down.
    Close,
}

/// Outcome of processing already-buffered input.
enum Buffered {
    StateChanged,
    NeedMore,
    Close,
}

/// Outcome of one socket read.
enum ReadOutcome {
    Data,
    WouldBlock,
    Eof,
}

struct EventLoop {
    id: usize,
    poll: Poll,
    conns: Slab<Conn>,
    rx: Receiver<IoCommand>,
    handle: IoThreadHandle,
    router: Arc<Router>,
    pool: Arc<BufferPool>,
    tasks: Arc<TaskPool>,
    tls: Option<Arc<rustls::ServerConfig>>,
    shared: Arc<WorkerShared>,
    drain_grace: Duration,
    drain_deadline: Option<Instant>,
    next_generation: u64,
}

impl EventLoop {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        debug!(io_thread = self.id, "I/O thread started");

        loop {
            match self.poll.poll(&mut events, Some(POLL_TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            self.drain_commands();

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    Token(conn_id) => self.drive(conn_id),
                }
            }

            if self.shared.shutdown.load(Ordering::SeqCst) && self.step_drain() {
                break;
            }
        }

        self.close_all();
        debug!(io_thread = self.id, "I/O thread stopped");
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                IoCommand::Register(stream, peer) => {
                    if self.shared.shutdown.load(Ordering::SeqCst) {
                        // Accepted just as the drain began; never dispatched.
                        self.shared.metrics.connection_closed();
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = self.register(stream, peer) {
                        debug!(peer = %peer, error = %e, "failed to register connection");
                        self.shared.metrics.connection_closed();
                    }
                }
                IoCommand::Complete {
                    conn_id,
                    generation,
                    exchange,
                    result,
                } => self.on_complete(conn_id, generation, exchange, result),
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let tls = match &self.tls {
            Some(config) => Some(
                rustls::ServerConnection::new(Arc::clone(config))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            ),
            None => None,
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let read_buf = self.pool.acquire();
        let state = if tls.is_some() {
            ConnState::Handshaking
        } else {
            ConnState::ReadingHead
        };

        let entry = self.conns.vacant_entry();
        let conn_id = entry.key();
        let mut conn = Conn {
            stream,
            tls,
            peer,
            generation,
            state,
            read_buf,
            req_keep_alive: true,
        };
        self.poll.registry().register(
            &mut conn.stream,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(conn);

        trace!(io_thread = self.id, conn_id, peer = %peer, "connection registered");

        // The peer may have sent bytes before registration; the edge for
        // them has already fired.
        self.drive(conn_id);
        Ok(())
    }

    /// Run a connection's state machine until it parks or closes.
    fn drive(&mut self, conn_id: usize) {
        loop {
            let Some(conn) = self.conns.get(conn_id) else {
                return;
            };
            let step = match conn.state {
                ConnState::Handshaking => self.step_handshake(conn_id),
                ConnState::ReadingHead
                | ConnState::ReadingBody { .. }
                | ConnState::Upgraded { .. } => self.step_read(conn_id),
                ConnState::InFlight => Step::Idle,
                ConnState::Writing { .. } => self.step_write(conn_id),
                ConnState::Closing => Step::Close,
            };
            match step {
                Step::Again => {}
                Step::Idle => return,
                Step::Close => {
                    self.close(conn_id);
                    return;
                }
            }
        }
    }

    fn step_handshake(&mut self, conn_id: usize) -> Step {
        let metrics = Arc::clone(&self.shared.metrics);
        let conn = &mut self.conns[conn_id];
        let tls = conn.tls.as_mut().expect("handshake without TLS session");

        loop {
            while tls.wants_write() {
                match tls.write_tls(&mut conn.stream) {
                    Ok(0) => return Step::Close,
                    Ok(n) => metrics.add_bytes_out(n as u64),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                    Err(e) => {
                        debug!(conn_id, error = %e, "handshake write error");
                        return Step::Close;
                    }
                }
            }

            if !tls.is_handshaking() {
                conn.state = ConnState::ReadingHead;
                trace!(conn_id, "TLS handshake complete");
                return Step::Again;
            }

            match tls.read_tls(&mut conn.stream) {
                Ok(0) => return Step::Close,
                Ok(n) => {
                    metrics.add_bytes_in(n as u64);
                    if let Err(e) = tls.process_new_packets() {
                        let error = DispatchError::Handshake(e.to_string());
                        debug!(conn_id, error = %error, "closing connection");
                        // Best-effort alert before the hard close.
                        let _ = tls.write_tls(&mut conn.stream);
                        return Step::Close;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                Err(e) => {
                    debug!(conn_id, error = %e, "handshake read error");
                    return Step::Close;
                }
            }
        }
    }

    /// Process buffered input, then pull more from the socket.
    fn step_read(&mut self, conn_id: usize) -> Step {
        loop {
            match self.process_buffered(conn_id) {
                Buffered::StateChanged => return Step::Again,
                Buffered::Close => return Step::Close,
                Buffered::NeedMore => {}
            }

            match self.read_some(conn_id) {
                Ok(ReadOutcome::Data) => {}
                Ok(ReadOutcome::WouldBlock) => return Step::Idle,
                Ok(ReadOutcome::Eof) => return Step::Close,
                Err(e) => {
                    debug!(conn_id, error = %e, "connection read error");
                    return Step::Close;
                }
            }
        }
    }

    fn process_buffered(&mut self, conn_id: usize) -> Buffered {
        let head_limit = self.pool.slice_size();
        let conn = &mut self.conns[conn_id];

        match &mut conn.state {
            ConnState::ReadingHead => {
                if conn.read_buf.is_empty() {
                    return Buffered::NeedMore;
                }
                match http::parse_request_head(&conn.read_buf) {
                    Ok(HeadParse::Complete(head, consumed)) => {
                        conn.read_buf.advance(consumed);
                        self.begin_body(conn_id, head)
                    }
                    Ok(HeadParse::Partial) => {
                        if conn.read_buf.len() >= head_limit {
                            let error =
                                DispatchError::Protocol("request head exceeds buffer slice".into());
                            warn!(conn_id, error = %error, "rejecting request");
                            self.respond_error(conn_id, 431);
                            Buffered::StateChanged
                        } else {
                            Buffered::NeedMore
                        }
                    }
                    Err(e) => {
                        self.fail(conn_id, DispatchError::Protocol(e.to_string()));
                        Buffered::StateChanged
                    }
                }
            }
            ConnState::ReadingBody { reader, body, .. } => {
                match reader {
                    BodyReader::Length { remaining } => {
                        let take = (*remaining).min(conn.read_buf.len());
                        if take > 0 {
                            body.extend_from_slice(&conn.read_buf[..take]);
                            conn.read_buf.advance(take);
                            *remaining -= take;
                        }
                        if *remaining > 0 {
                            return Buffered::NeedMore;
                        }
                    }
                    BodyReader::Chunked(decoder) => {
                        if conn.read_buf.is_empty() && !decoder.is_done() {
                            return Buffered::NeedMore;
                        }
                        let consumed = match decoder.feed(&conn.read_buf, body) {
                            Ok(n) => n,
                            Err(e) => {
                                self.fail(conn_id, DispatchError::Protocol(e.to_string()));
                                return Buffered::StateChanged;
                            }
                        };
                        conn.read_buf.advance(consumed);
                        if body.len() > MAX_BODY {
                            self.respond_error(conn_id, 413);
                            return Buffered::StateChanged;
                        }
                        if !decoder.is_done() {
                            return Buffered::NeedMore;
                        }
                    }
                }

                // Body complete: take it out and dispatch.
                let state = std::mem::replace(&mut conn.state, ConnState::Closing);
                let ConnState::ReadingBody { head, body, .. } = state else {
                    unreachable!("state changed underneath body read");
                };
                self.dispatch(conn_id, head, body);
                Buffered::StateChanged
            }
            ConnState::Upgraded { proto } => {
                if conn.read_buf.is_empty() {
                    return Buffered::NeedMore;
                }
                let mut out = BytesMut::new();
                let keep_open = proto.on_bytes(&conn.read_buf, &mut out);
                conn.read_buf.clear();

                if out.is_empty() {
                    if keep_open {
                        Buffered::NeedMore
                    } else {
                        Buffered::Close
                    }
                } else {
                    let state = std::mem::replace(&mut conn.state, ConnState::Closing);
                    let ConnState::Upgraded { proto } = state else {
                        unreachable!("state changed underneath upgraded read");
                    };
                    let after = if keep_open {
                        AfterWrite::Upgrade(proto)
                    } else {
                        AfterWrite::Close
                    };
                    conn.state = ConnState::Writing {
                        buf: out,
                        written: 0,
                        after,
                        is_exchange: false,
                    };
                    Buffered::StateChanged
                }
            }
            _ => Buffered::NeedMore,
        }
    }

    /// Decide body framing for a parsed head and either dispatch or start
    /// collecting the body.
    fn begin_body(&mut self, conn_id: usize, head: RequestHead) -> Buffered {
        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                self.fail(conn_id, DispatchError::Protocol(e.to_string()));
                return Buffered::StateChanged;
            }
        };

        match framing {
            BodyFraming::None => {
                self.dispatch(conn_id, head, BytesMut::new());
                Buffered::StateChanged
            }
            BodyFraming::ContentLength(len) => {
                if len > MAX_BODY {
                    self.respond_error(conn_id, 413);
                    return Buffered::StateChanged;
                }
                let conn = &mut self.conns[conn_id];
                conn.state = ConnState::ReadingBody {
                    head,
                    reader: BodyReader::Length { remaining: len },
                    body: BytesMut::with_capacity(len.min(64 * 1024)),
                };
                Buffered::StateChanged
            }
            BodyFraming::Chunked => {
                let conn = &mut self.conns[conn_id];
                conn.state = ConnState::ReadingBody {
                    head,
                    reader: BodyReader::Chunked(ChunkedDecoder::new()),
                    body: BytesMut::new(),
                };
                Buffered::StateChanged
            }
        }
    }

    /// Hand a complete request to its handler.
    ///
    /// Direct handlers run here; blocking handlers move the owned exchange
    /// onto the task pool and the connection waits in `InFlight`.
    fn dispatch(&mut self, conn_id: usize, head: RequestHead, body: BytesMut) {
        let draining = self.shared.shutdown.load(Ordering::SeqCst);
        let handler = self.router.lookup(&head.method, &head.path).cloned();
        if head.wants_upgrade() {
            trace!(conn_id, "request asks for protocol upgrade");
        }
        let conn = &mut self.conns[conn_id];
        conn.req_keep_alive = head.keep_alive() && !draining;

        let peer = conn.peer;
        let generation = conn.generation;
        let mut exchange = Exchange::new(head, body.freeze(), peer, BytesMut::new());

        match handler {
            None => {
                trace!(conn_id, path = %exchange.path(), "no route");
                self.respond_error(conn_id, 404);
            }
            Some(Handler::Direct(handler)) => {
                let result = handler.handle(&mut exchange);
                self.finish_exchange(conn_id, exchange, result);
            }
            Some(Handler::Blocking(handler)) => {
                self.conns[conn_id].state = ConnState::InFlight;
                let home = self.handle.clone();
                let submitted = self.tasks.submit(Box::new(move || {
                    let mut exchange = exchange;
                    let result = handler.handle(&mut exchange);
                    home.send(IoCommand::Complete {
                        conn_id,
                        generation,
                        exchange,
                        result,
                    });
                }));

                if submitted.is_err() {
                    self.fail(conn_id, DispatchError::TaskRejected);
                }
            }
        }
    }

    /// A blocking dispatch came back from the task pool.
    fn on_complete(
        &mut self,
        conn_id: usize,
        generation: u64,
        exchange: Exchange,
        result: Result<(), HandlerError>,
    ) {
        let matches = self
            .conns
            .get(conn_id)
            .map(|conn| {
                conn.generation == generation && matches!(conn.state, ConnState::InFlight)
            })
            .unwrap_or(false);
        if !matches {
            // The connection died while the task ran; drop the completion.
            trace!(conn_id, "dropping completion for closed connection");
            return;
        }
        self.finish_exchange(conn_id, exchange, result);
        self.drive(conn_id);
    }

    /// Turn a finished exchange into wire bytes and start flushing.
    fn finish_exchange(
        &mut self,
        conn_id: usize,
        exchange: Exchange,
        result: Result<(), HandlerError>,
    ) {
        trace!(conn_id, status = exchange.status(), "exchange finished");
        let (mut response, mut body, upgrade) = exchange.take_parts();

        if let Err(e) = result {
            // Nothing has been flushed yet, so a clean error response is
            // still possible.
            let error = DispatchError::Handler(e);
            error!(conn_id, error = %error, "handler failed");
            response = ResponseHead::new(error.status());
            body.clear();
        }

        let conn = &mut self.conns[conn_id];
        let response_close = response
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let keep_alive = conn.req_keep_alive && !response_close;

        let after = match upgrade {
            Some(proto) if response.status == 101 => AfterWrite::Upgrade(proto),
            _ if keep_alive => AfterWrite::KeepAlive,
            _ => AfterWrite::Close,
        };

        let mut wire = self.pool.acquire();
        response.encode(body.len(), keep_alive, &mut wire);
        wire.extend_from_slice(&body);

        conn.state = ConnState::Writing {
            buf: wire,
            written: 0,
            after,
            is_exchange: true,
        };
    }

    /// Answer a failed exchange per the error taxonomy: overloads get a
    /// retryable 503, everything else a protocol-error status.
    fn fail(&mut self, conn_id: usize, error: DispatchError) {
        match &error {
            DispatchError::TaskRejected => {
                self.shared.metrics.task_rejected();
                warn!(conn_id, error = %error, "responding with overload status");
                let mut response = ResponseHead::new(error.status());
                response.set("Retry-After", "1");
                let keep_alive = self.conns[conn_id].req_keep_alive;
                self.respond_simple(conn_id, response, keep_alive);
            }
            _ => {
                debug!(conn_id, error = %error, "request failed");
                self.respond_error(conn_id, error.status());
            }
        }
    }

    /// Synchronous error response assembled on the I/O thread.
    fn respond_error(&mut self, conn_id: usize, status: u16) {
        // Framing errors poison the connection; other statuses may keep it.
        let keep_alive = match status {
            400 | 413 | 431 => false,
            _ => self.conns[conn_id].req_keep_alive,
        };
        self.respond_simple(conn_id, ResponseHead::new(status), keep_alive);
    }

    fn respond_simple(&mut self, conn_id: usize, response: ResponseHead, keep_alive: bool) {
        let mut wire = self.pool.acquire();
        response.encode(0, keep_alive, &mut wire);

        let conn = &mut self.conns[conn_id];
        conn.state = ConnState::Writing {
            buf: wire,
            written: 0,
            after: if keep_alive {
                AfterWrite::KeepAlive
            } else {
                AfterWrite::Close
            },
            is_exchange: true,
        };
    }

    fn step_write(&mut self, conn_id: usize) -> Step {
        let metrics = Arc::clone(&self.shared.metrics);
        let pool = Arc::clone(&self.pool);
        let conn = &mut self.conns[conn_id];
        let ConnState::Writing {
            buf,
            written,
            ..
        } = &mut conn.state
        else {
            return Step::Idle;
        };

        match conn.tls.as_mut() {
            None => {
                while *written < buf.len() {
                    match conn.stream.write(&buf[*written..]) {
                        Ok(0) => return Step::Close,
                        Ok(n) => {
                            *written += n;
                            metrics.add_bytes_out(n as u64);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(conn_id, error = %e, "connection write error");
                            return Step::Close;
                        }
                    }
                }
            }
            Some(tls) => {
                // Hand remaining plaintext to the session, then flush the
                // produced records until the socket pushes back.
                if *written < buf.len() {
                    match tls.writer().write(&buf[*written..]) {
                        Ok(n) => *written += n,
                        Err(e) => {
                            debug!(conn_id, error = %e, "TLS write error");
                            return Step::Close;
                        }
                    }
                }
                while tls.wants_write() {
                    match tls.write_tls(&mut conn.stream) {
                        Ok(0) => return Step::Close,
                        Ok(n) => metrics.add_bytes_out(n as u64),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(conn_id, error = %e, "connection write error");
                            return Step::Close;
                        }
                    }
                }
                if *written < buf.len() {
                    // More plaintext still to feed.
                    return Step::Again;
                }
            }
        }

        // Fully flushed: move to whatever comes next.
        let state = std::mem::replace(&mut conn.state, ConnState::Closing);
        let ConnState::Writing {
            buf,
            after,
            is_exchange,
            ..
        } = state
        else {
            unreachable!("write state changed underneath flush");
        };
        pool.release(buf);
        if is_exchange {
            metrics.exchange_completed();
        }

        match after {
            AfterWrite::KeepAlive => {
                conn.state = ConnState::ReadingHead;
                Step::Again
            }
            AfterWrite::Close => Step::Close,
            AfterWrite::Upgrade(proto) => {
                trace!(conn_id, "connection upgraded");
                conn.state = ConnState::Upgraded { proto };
                Step::Again
            }
        }
    }

    /// Pull bytes from the socket into the connection's read buffer.
    fn read_some(&mut self, conn_id: usize) -> io::Result<ReadOutcome> {
        let chunk = self.pool.slice_size();
        let metrics = Arc::clone(&self.shared.metrics);
        let conn = &mut self.conns[conn_id];

        match conn.tls.as_mut() {
            None => {
                let old = conn.read_buf.len();
                conn.read_buf.resize(old + chunk, 0);
                let result = conn.stream.read(&mut conn.read_buf[old..]);
                match result {
                    Ok(0) => {
                        conn.read_buf.truncate(old);
                        Ok(ReadOutcome::Eof)
                    }
                    Ok(n) => {
                        conn.read_buf.truncate(old + n);
                        metrics.add_bytes_in(n as u64);
                        Ok(ReadOutcome::Data)
                    }
                    Err(e) => {
                        conn.read_buf.truncate(old);
                        match e.kind() {
                            io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                            io::ErrorKind::Interrupted => Ok(ReadOutcome::Data),
                            _ => Err(e),
                        }
                    }
                }
            }
            Some(tls) => {
                let wire = match tls.read_tls(&mut conn.stream) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::WouldBlock)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Ok(ReadOutcome::Data)
                    }
                    Err(e) => return Err(e),
                };
                metrics.add_bytes_in(wire as u64);

                if let Err(e) = tls.process_new_packets() {
                    let _ = tls.write_tls(&mut conn.stream);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }

                let mut plain = [0u8; 4096];
                loop {
                    match tls.reader().read(&mut plain) {
                        Ok(0) => return Ok(ReadOutcome::Eof),
                        Ok(n) => conn.read_buf.extend_from_slice(&plain[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(ReadOutcome::Data)
            }
        }
    }

    fn close(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.conns.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);

            // A graceful TLS close sends close_notify if the socket allows.
            if let Some(tls) = conn.tls.as_mut() {
                tls.send_close_notify();
                let _ = tls.write_tls(&mut conn.stream);
            }

            self.pool.release(std::mem::take(&mut conn.read_buf));
            if let ConnState::Writing { buf, .. } =
                std::mem::replace(&mut conn.state, ConnState::Closing)
            {
                self.pool.release(buf);
            }
            self.shared.metrics.connection_closed();
            trace!(io_thread = self.id, conn_id, "connection closed");
        }
    }

    /// One drain iteration. Returns true once the thread may exit.
    fn step_drain(&mut self) -> bool {
        let deadline = *self
            .drain_deadline
            .get_or_insert_with(|| Instant::now() + self.drain_grace);

        // Pending reads are cancelled immediately; exchanges already
        // dispatched or flushing get the grace period.
        let idle: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                matches!(
                    conn.state,
                    ConnState::Handshaking
                        | ConnState::ReadingHead
                        | ConnState::ReadingBody { .. }
                        | ConnState::Upgraded { .. }
                )
            })
            .map(|(id, _)| id)
            .collect();
        for conn_id in idle {
            self.close(conn_id);
        }

        self.conns.is_empty() || Instant::now() >= deadline
    }

    fn close_all(&mut self) {
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            self.close(conn_id);
        }

        // Anything still parked in the intake channel will never run.
        while let Ok(command) = self.rx.try_recv() {
            if let IoCommand::Register(stream, _) = command {
                self.shared.metrics.connection_closed();
                drop(stream);
            }
        }
    }
}
