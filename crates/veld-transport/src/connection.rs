//! A multiplexed connection: a fixed pool of pipes, a stream table, and
//! the driver that demultiplexes inbound frames.
//!
//! All observable connection state is touched from one driver task; read
//! and write loops per pipe hand it events over a channel, which is also
//! where receiver callbacks run. Lifecycle: Connecting becomes
//! Established when the handshake ping answers, Draining on local close,
//! and Closed on fatal error or remote close. No frame is delivered once
//! the connection is Closed, and there is no reconnect at this layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::split;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use veld_core::config::TransportConfig;
use veld_core::wire::{self, ControlOp, StreamId};
use veld_core::{BufferPool, Chunk, Error, ProtocolError, Result};

use crate::pipe::BoxPipe;
use crate::read_buffer::{run_read_loop, ModeHook, ReadBuffer};
use crate::stream::Stream;
use crate::write_queue::{run_write_loop, FrameCompletion, WriteQueue};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Established,
    Draining,
    Closed,
}

/// What a stream's receiver callback sees.
#[derive(Debug)]
pub enum StreamEvent {
    /// One inbound chunk, in sender order.
    Data(Chunk),
    /// The peer half-closed the stream.
    RemoteClosed,
    /// The connection died under the stream. Terminal; sent exactly once.
    Disconnected,
}

/// Delivery target of one stream. Runs on the driver.
pub type ReceiverFn = Box<dyn FnMut(StreamEvent) + Send>;

/// Decides an inbound stream inside the delivery callback: install a
/// receiver to accept it, or return `None` to reject (a CLOSE goes back).
pub type AcceptFn = Box<dyn FnMut(StreamId) -> Option<ReceiverFn> + Send>;

/// An accept handler that rejects every inbound stream.
pub fn reject_inbound() -> AcceptFn {
    Box::new(|_| None)
}

pub struct ConnectionOptions {
    /// Queued outbound bytes across all pipes beyond which `send`
    /// returns WouldBlock.
    pub high_water_mark: usize,
    pub handshake_timeout: Duration,
    /// Keepalive ping cadence; an unanswered ping fails the connection.
    pub ping_interval: Option<Duration>,
    /// Instrumentation for the first pipe's read buffer.
    pub read_mode_hook: Option<ModeHook>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            high_water_mark: wire::DEFAULT_HIGH_WATER,
            handshake_timeout: Duration::from_secs(wire::HANDSHAKE_TIMEOUT_SECS),
            ping_interval: Some(Duration::from_secs(wire::PING_INTERVAL_SECS)),
            read_mode_hook: None,
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        ConnectionOptions {
            high_water_mark: config.high_water_mark,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            ping_interval: (config.ping_interval_secs > 0)
                .then(|| Duration::from_secs(config.ping_interval_secs)),
            read_mode_hook: None,
        }
    }
}

// ── Events from the pipe tasks ───────────────────────────────────────────────

pub(crate) enum ConnEvent {
    Frame {
        pipe: usize,
        sid: StreamId,
        chunk: Chunk,
    },
    PipeFailed {
        pipe: usize,
        failure: PipeFailure,
    },
    /// A frame for `sid` fully reached its pipe.
    Flushed {
        sid: StreamId,
    },
}

pub(crate) enum PipeFailure {
    Eof,
    Io(std::io::Error),
    Protocol(ProtocolError),
}

// ── Shared state ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Acceptor,
}

pub(crate) struct PipeHandle {
    queue: Arc<Mutex<WriteQueue>>,
    notify: Arc<Notify>,
    queued: Arc<AtomicUsize>,
}

pub(crate) struct StreamEntry {
    receiver: Option<ReceiverFn>,
    local_closed: bool,
    remote_closed: bool,
    /// Outbound frames not yet flushed; the entry lives until this hits
    /// zero after both sides closed.
    pending_frames: Arc<AtomicUsize>,
    pipe: usize,
}

struct ConnCore {
    phase: ConnState,
    phase_tx: watch::Sender<ConnState>,
    streams: HashMap<u64, StreamEntry>,
    next_local: u64,
    rr_cursor: usize,
    role: Role,
    handshake_nonce: u64,
    goaway_sent: bool,
}

pub(crate) struct Shared {
    state: Mutex<ConnCore>,
    pipes: Vec<PipeHandle>,
    high_water: usize,
    phase_rx: watch::Receiver<ConnState>,
    header_pool: BufferPool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnCore> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn total_queued(&self) -> usize {
        self.pipes.iter().map(|p| p.queued.load(Ordering::Acquire)).sum()
    }

    fn enqueue(&self, pipe: usize, header: Bytes, payload: Option<Bytes>, completion: Option<FrameCompletion>) {
        let handle = &self.pipes[pipe];
        {
            let mut queue = handle.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_frame(header, payload, completion);
        }
        handle.notify.notify_one();
    }

    /// Control frames ride the first pipe and bypass backpressure.
    fn enqueue_control(&self, op: ControlOp) {
        self.enqueue(0, Bytes::from(op.to_frame()), None, None);
    }

    /// Round-robin over pipes whose queues are below their share of the
    /// high-water mark; a saturated pool falls back to plain rotation.
    fn pick_pipe(&self, core: &mut ConnCore) -> usize {
        let n = self.pipes.len();
        let per_pipe_mark = (self.high_water / n).max(1);
        for k in 0..n {
            let idx = (core.rr_cursor + k) % n;
            if self.pipes[idx].queued.load(Ordering::Acquire) < per_pipe_mark {
                core.rr_cursor = (idx + 1) % n;
                return idx;
            }
        }
        let idx = core.rr_cursor % n;
        core.rr_cursor = (idx + 1) % n;
        idx
    }

    pub(crate) fn send_on(&self, sid: StreamId, chunk: Chunk) -> Result<()> {
        if sid.is_control() {
            return Err(Error::Protocol(ProtocolError::DataOnControlStream));
        }
        let (pipe, pending) = {
            let core = self.state();
            match core.phase {
                ConnState::Connecting => return Err(Error::WouldBlock),
                ConnState::Closed => return Err(Error::StreamClosed),
                ConnState::Established | ConnState::Draining => {}
            }
            let entry = core.streams.get(&sid.0).ok_or(Error::StreamClosed)?;
            if entry.local_closed {
                return Err(Error::StreamClosed);
            }
            (entry.pipe, Arc::clone(&entry.pending_frames))
        };

        let header = {
            let mut buf = self.header_pool.acquire();
            wire::encode_frame_header(sid, chunk.len() as u64, &mut buf);
            Bytes::copy_from_slice(&buf)
        };
        if self.total_queued() + header.len() + chunk.len() > self.high_water {
            return Err(Error::WouldBlock);
        }
        pending.fetch_add(1, Ordering::AcqRel);
        self.enqueue(
            pipe,
            header,
            Some(chunk.into_bytes()),
            Some(FrameCompletion {
                sid,
                pending: Some(pending),
            }),
        );
        Ok(())
    }

    pub(crate) fn close_stream(&self, sid: StreamId) -> Result<()> {
        {
            let mut core = self.state();
            if core.phase == ConnState::Closed {
                return Err(Error::StreamClosed);
            }
            let entry = core.streams.get_mut(&sid.0).ok_or(Error::StreamClosed)?;
            if entry.local_closed {
                return Ok(());
            }
            entry.local_closed = true;
        }
        self.enqueue_control(ControlOp::Close(sid));
        self.maybe_destroy(sid);
        Ok(())
    }

    pub(crate) fn set_receiver(&self, sid: StreamId, receiver: ReceiverFn) {
        let mut core = self.state();
        if let Some(entry) = core.streams.get_mut(&sid.0) {
            entry.receiver = Some(receiver);
        }
    }

    pub(crate) fn clear_receiver(&self, sid: StreamId) {
        let mut core = self.state();
        if let Some(entry) = core.streams.get_mut(&sid.0) {
            entry.receiver = None;
        }
    }

    /// Drop the entry once both directions closed and nothing for it is
    /// still queued; a graceful drain finishes when the table empties.
    fn maybe_destroy(&self, sid: StreamId) {
        {
            let mut core = self.state();
            let done = core.streams.get(&sid.0).is_some_and(|e| {
                e.local_closed && e.remote_closed && e.pending_frames.load(Ordering::Acquire) == 0
            });
            if done {
                core.streams.remove(&sid.0);
                tracing::debug!(stream = %sid, "stream destroyed");
            }
        }
        self.finish_drain_if_idle();
    }

    fn finish_drain_if_idle(&self) {
        let finished = {
            let mut core = self.state();
            if core.phase == ConnState::Draining && core.streams.is_empty() {
                core.phase = ConnState::Closed;
                let _ = core.phase_tx.send(ConnState::Closed);
                true
            } else {
                false
            }
        };
        if finished {
            self.shutdown_pipes();
            tracing::info!("connection drained and closed");
        }
    }

    fn shutdown_pipes(&self) {
        for pipe in &self.pipes {
            pipe.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .shutdown();
            pipe.notify.notify_one();
        }
    }

    /// Fatal path: every open stream hears Disconnected exactly once, in
    /// ascending StreamId order, then the connection is Closed.
    fn fail_connection(&self, failure: &PipeFailure) {
        let receivers = {
            let mut core = self.state();
            if core.phase == ConnState::Closed {
                return;
            }
            if matches!(failure, PipeFailure::Protocol(_)) && !core.goaway_sent {
                core.goaway_sent = true;
                // best effort; the queue drains if the pipe still writes
                self.enqueue_control(ControlOp::GoAway(1));
            }
            core.phase = ConnState::Closed;
            let _ = core.phase_tx.send(ConnState::Closed);
            let mut ids: Vec<u64> = core.streams.keys().copied().collect();
            ids.sort_unstable();
            let receivers: Vec<(u64, ReceiverFn)> = ids
                .into_iter()
                .filter_map(|id| {
                    core.streams
                        .get_mut(&id)
                        .and_then(|e| e.receiver.take())
                        .map(|r| (id, r))
                })
                .collect();
            core.streams.clear();
            receivers
        };
        match failure {
            PipeFailure::Eof => tracing::info!("connection closed by peer"),
            PipeFailure::Io(e) => tracing::warn!(error = %e, "connection failed"),
            PipeFailure::Protocol(e) => tracing::warn!(error = %e, "protocol violation, connection failed"),
        }
        for (id, mut receiver) in receivers {
            tracing::debug!(stream = id, "delivering terminal disconnect");
            receiver(StreamEvent::Disconnected);
        }
        self.shutdown_pipes();
    }
}

// ── Public handle ────────────────────────────────────────────────────────────

/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct MultiplexedConnection {
    shared: Arc<Shared>,
}

impl MultiplexedConnection {
    /// Open a connection over `pipes` as the initiating side. Must run
    /// inside a tokio runtime; the per-pipe IO tasks and the driver are
    /// spawned here.
    pub fn initiate(pipes: Vec<BoxPipe>, accept: AcceptFn, options: ConnectionOptions) -> Self {
        Self::start(pipes, accept, options, Role::Initiator)
    }

    /// Open a connection over `pipes` as the accepting side.
    pub fn accept(pipes: Vec<BoxPipe>, accept: AcceptFn, options: ConnectionOptions) -> Self {
        Self::start(pipes, accept, options, Role::Acceptor)
    }

    fn start(
        pipes: Vec<BoxPipe>,
        accept: AcceptFn,
        mut options: ConnectionOptions,
        role: Role,
    ) -> Self {
        assert!(
            (1..=4).contains(&pipes.len()),
            "a connection takes one to four pipes"
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(ConnState::Connecting);

        let mut handles = Vec::with_capacity(pipes.len());
        for (idx, pipe) in pipes.into_iter().enumerate() {
            let (reader, writer) = split(pipe);
            let queued = Arc::new(AtomicUsize::new(0));
            let queue = Arc::new(Mutex::new(WriteQueue::new(Arc::clone(&queued))));
            let notify = Arc::new(Notify::new());
            let hook = if idx == 0 {
                options.read_mode_hook.take()
            } else {
                None
            };
            tokio::spawn(run_read_loop(
                idx,
                reader,
                ReadBuffer::new(hook),
                events_tx.clone(),
            ));
            tokio::spawn(run_write_loop(
                idx,
                writer,
                Arc::clone(&queue),
                Arc::clone(&notify),
                events_tx.clone(),
            ));
            handles.push(PipeHandle {
                queue,
                notify,
                queued,
            });
        }

        let handshake_nonce = rand::random::<u64>();
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnCore {
                phase: ConnState::Connecting,
                phase_tx,
                streams: HashMap::new(),
                next_local: match role {
                    Role::Initiator => 1,
                    Role::Acceptor => 2,
                },
                rr_cursor: 0,
                role,
                handshake_nonce,
                goaway_sent: false,
            }),
            pipes: handles,
            high_water: options.high_water_mark,
            phase_rx,
            header_pool: BufferPool::new(32, 16),
        });

        if role == Role::Initiator {
            shared.enqueue_control(ControlOp::Ping(handshake_nonce));
        }
        tokio::spawn(run_driver(
            Arc::clone(&shared),
            events_rx,
            accept,
            options.handshake_timeout,
            options.ping_interval,
        ));
        MultiplexedConnection { shared }
    }

    /// Wait for the handshake. Errs if the connection dies first.
    pub async fn established(&self) -> Result<()> {
        let mut rx = self.shared.phase_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnState::Established | ConnState::Draining => return Ok(()),
                ConnState::Closed => return Err(Error::StreamClosed),
                ConnState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::StreamClosed);
            }
        }
    }

    pub fn state(&self) -> ConnState {
        self.shared.state().phase
    }

    /// Open an outbound stream with its receiver installed atomically.
    pub fn open(&self, receiver: ReceiverFn) -> Result<Stream> {
        let sid = {
            let mut core = self.shared.state();
            match core.phase {
                ConnState::Connecting => return Err(Error::WouldBlock),
                ConnState::Draining | ConnState::Closed => return Err(Error::StreamClosed),
                ConnState::Established => {}
            }
            let sid = StreamId(core.next_local);
            core.next_local += 2;
            let pipe = self.shared.pick_pipe(&mut core);
            core.streams.insert(
                sid.0,
                StreamEntry {
                    receiver: Some(receiver),
                    local_closed: false,
                    remote_closed: false,
                    pending_frames: Arc::new(AtomicUsize::new(0)),
                    pipe,
                },
            );
            sid
        };
        self.shared.enqueue_control(ControlOp::Open(sid));
        tracing::debug!(stream = %sid, "stream opened");
        Ok(Stream::new(Arc::clone(&self.shared), sid))
    }

    /// Frame `chunk` for `sid` and queue it on the stream's pipe.
    pub fn send(&self, sid: StreamId, chunk: Chunk) -> Result<()> {
        self.shared.send_on(sid, chunk)
    }

    /// Local close: no new streams; existing streams may finish. The
    /// connection reaches Closed once the table empties.
    pub fn close(&self) {
        let send_goaway = {
            let mut core = self.shared.state();
            match core.phase {
                ConnState::Connecting | ConnState::Established => {
                    core.phase = ConnState::Draining;
                    let _ = core.phase_tx.send(ConnState::Draining);
                    !std::mem::replace(&mut core.goaway_sent, true)
                }
                ConnState::Draining | ConnState::Closed => false,
            }
        };
        if send_goaway {
            self.shared.enqueue_control(ControlOp::GoAway(0));
        }
        self.shared.finish_drain_if_idle();
    }

    /// Liveness probe outside the keepalive cadence.
    pub fn ping(&self) -> Result<()> {
        if self.shared.state().phase == ConnState::Closed {
            return Err(Error::StreamClosed);
        }
        self.shared.enqueue_control(ControlOp::Ping(rand::random()));
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.shared.state().streams.len()
    }

    /// Outbound bytes queued across all pipes.
    pub fn queued_bytes(&self) -> usize {
        self.shared.total_queued()
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

async fn run_driver(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
    mut accept: AcceptFn,
    handshake_timeout: Duration,
    ping_interval: Option<Duration>,
) {
    let mut hs_deadline = Some(Instant::now() + handshake_timeout);
    let mut next_ping: Option<Instant> = None;
    let mut awaiting_pong: Option<(u64, Instant)> = None;

    loop {
        let timer = [hs_deadline, next_ping, awaiting_pong.map(|(_, d)| d)]
            .into_iter()
            .flatten()
            .min();
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnEvent::Frame { pipe, sid, chunk } => {
                        if sid.is_control() {
                            match ControlOp::decode(&chunk) {
                                Ok(op) => {
                                    let established = handle_control(
                                        &shared, op, &mut accept, &mut awaiting_pong,
                                    );
                                    if established {
                                        hs_deadline = None;
                                        next_ping = ping_interval.map(|i| Instant::now() + i);
                                    }
                                    if shared.state().phase == ConnState::Closed {
                                        break;
                                    }
                                }
                                Err(violation) => {
                                    shared.fail_connection(&PipeFailure::Protocol(violation));
                                    break;
                                }
                            }
                        } else {
                            deliver_data(&shared, &mut accept, pipe, sid, chunk);
                        }
                    }
                    ConnEvent::PipeFailed { pipe, failure } => {
                        tracing::debug!(pipe, "pipe reported failure");
                        shared.fail_connection(&failure);
                        break;
                    }
                    ConnEvent::Flushed { sid } => {
                        shared.maybe_destroy(sid);
                    }
                }
            }
            _ = tokio::time::sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                let now = Instant::now();
                if hs_deadline.is_some_and(|d| now >= d) {
                    if shared.state().phase == ConnState::Connecting {
                        shared.fail_connection(&PipeFailure::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "handshake timed out",
                        )));
                        break;
                    }
                    hs_deadline = None;
                }
                if let Some((_, deadline)) = awaiting_pong {
                    if now >= deadline {
                        shared.fail_connection(&PipeFailure::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "keepalive ping unanswered",
                        )));
                        break;
                    }
                }
                if let (Some(deadline), Some(interval)) = (next_ping, ping_interval) {
                    if now >= deadline {
                        let nonce = rand::random::<u64>();
                        shared.enqueue_control(ControlOp::Ping(nonce));
                        awaiting_pong = Some((nonce, now + interval));
                        next_ping = Some(now + interval);
                    }
                }
            }
        }
    }
}

/// Returns true when this control frame completed the handshake.
fn handle_control(
    shared: &Arc<Shared>,
    op: ControlOp,
    accept: &mut AcceptFn,
    awaiting_pong: &mut Option<(u64, Instant)>,
) -> bool {
    match op {
        ControlOp::Ping(nonce) => {
            shared.enqueue_control(ControlOp::Pong(nonce));
            let mut core = shared.state();
            if core.phase == ConnState::Connecting && core.role == Role::Acceptor {
                core.phase = ConnState::Established;
                let _ = core.phase_tx.send(ConnState::Established);
                tracing::info!("connection established");
                return true;
            }
            false
        }
        ControlOp::Pong(nonce) => {
            if awaiting_pong.is_some_and(|(expected, _)| expected == nonce) {
                *awaiting_pong = None;
            }
            let mut core = shared.state();
            if core.phase == ConnState::Connecting
                && core.role == Role::Initiator
                && nonce == core.handshake_nonce
            {
                core.phase = ConnState::Established;
                let _ = core.phase_tx.send(ConnState::Established);
                tracing::info!("connection established");
                return true;
            }
            false
        }
        ControlOp::Open(sid) => {
            let known = shared.state().streams.contains_key(&sid.0);
            if !known && !sid.is_control() {
                accept_stream(shared, accept, sid);
            }
            false
        }
        ControlOp::Close(sid) => {
            let receiver = {
                let mut core = shared.state();
                match core.streams.get_mut(&sid.0) {
                    Some(entry) if !entry.remote_closed => {
                        entry.remote_closed = true;
                        entry.receiver.take()
                    }
                    _ => None,
                }
            };
            if let Some(mut receiver) = receiver {
                receiver(StreamEvent::RemoteClosed);
                restore_receiver(shared, sid, receiver);
            }
            shared.maybe_destroy(sid);
            false
        }
        ControlOp::GoAway(reason) => {
            tracing::info!(reason, "peer sent goaway");
            shared.fail_connection(&PipeFailure::Eof);
            false
        }
    }
}

/// Run the accept handler for an unknown inbound stream. The decision is
/// made inside this call: a returned receiver installs the stream, and
/// `None` sends CLOSE back.
fn accept_stream(shared: &Arc<Shared>, accept: &mut AcceptFn, sid: StreamId) -> bool {
    match accept(sid) {
        Some(receiver) => {
            let mut core = shared.state();
            let pipe = shared.pick_pipe(&mut core);
            core.streams.insert(
                sid.0,
                StreamEntry {
                    receiver: Some(receiver),
                    local_closed: false,
                    remote_closed: false,
                    pending_frames: Arc::new(AtomicUsize::new(0)),
                    pipe,
                },
            );
            tracing::debug!(stream = %sid, "inbound stream accepted");
            true
        }
        None => {
            tracing::debug!(stream = %sid, "inbound stream rejected");
            shared.enqueue_control(ControlOp::Close(sid));
            false
        }
    }
}

fn deliver_data(
    shared: &Arc<Shared>,
    accept: &mut AcceptFn,
    pipe: usize,
    sid: StreamId,
    chunk: Chunk,
) {
    enum Action {
        Deliver(ReceiverFn),
        NewStream,
        Drop,
    }
    let action = {
        let mut core = shared.state();
        if core.phase == ConnState::Closed {
            return;
        }
        match core.streams.get_mut(&sid.0) {
            Some(entry) => match entry.receiver.take() {
                Some(receiver) => Action::Deliver(receiver),
                // receiver cancelled; the chunk is silently dropped
                None => Action::Drop,
            },
            None => Action::NewStream,
        }
    };
    match action {
        Action::Deliver(mut receiver) => {
            receiver(StreamEvent::Data(chunk));
            restore_receiver(shared, sid, receiver);
        }
        Action::Drop => {}
        Action::NewStream => {
            tracing::trace!(stream = %sid, pipe, "first frame of an unknown stream");
            if accept_stream(shared, accept, sid) {
                let receiver = {
                    let mut core = shared.state();
                    core.streams.get_mut(&sid.0).and_then(|e| e.receiver.take())
                };
                if let Some(mut receiver) = receiver {
                    receiver(StreamEvent::Data(chunk));
                    restore_receiver(shared, sid, receiver);
                }
            }
        }
    }
}

/// Put a receiver back unless the stream vanished or swapped receivers
/// while the callback ran.
fn restore_receiver(shared: &Arc<Shared>, sid: StreamId, receiver: ReceiverFn) {
    let mut core = shared.state();
    if let Some(entry) = core.streams.get_mut(&sid.0) {
        if entry.receiver.is_none() {
            entry.receiver = Some(receiver);
        }
    }
}
