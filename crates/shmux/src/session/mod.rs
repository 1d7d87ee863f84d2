//! Sessions.
//!
//! A [`Session`] owns one control connection, the shared segments and queue
//! file behind it, and the table of streams multiplexed over it. Incoming
//! events are processed on the dispatcher thread the session is registered
//! with; stream reads and writes run on caller threads.
//!
//! State machine: `Connecting -> Established -> Restarting -> Closed`.
//! `Restarting` is entered locally by [`Session::hot_restart`], or when the
//! peer announces its own restart.

mod handshake;
mod inbound;
mod outbound;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::config::SessionConfig;
use crate::metrics::{Monitor, SessionCounters, SessionMetrics};
use crate::poller::{DispatcherHandle, EventHandler, Token};
use crate::queue::{Consumer, Direction, Producer, Queue, QueueFile};
use crate::stream::{Stream, StreamShared};
use crate::transport::{Transport, TransportKind};
use crate::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Created the shared memory and opens odd stream ids
    Client = 0,
    /// Attached to the client's shared memory and opens even stream ids
    Server = 1,
}

impl Role {
    pub(crate) const fn send_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ClientToServer,
            Self::Server => Direction::ServerToClient,
        }
    }

    pub(crate) const fn recv_direction(self) -> Direction {
        match self {
            Self::Client => Direction::ServerToClient,
            Self::Server => Direction::ClientToServer,
        }
    }

    const fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether streams with `id` are opened by this side.
    pub(crate) const fn opens(self, id: u32) -> bool {
        (id % 2 == 1) == matches!(self, Self::Client)
    }
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Client),
            1 => Ok(Self::Server),
            other => Err(Error::HotRestart(format!("unknown session role {other}"))),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Handshake in progress
    Connecting = 0,
    /// Streams flow normally
    Established = 1,
    /// This side or the peer is handing the session to a successor
    Restarting = 2,
    /// Torn down or handed off; terminal
    Closed = 3,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Established,
            2 => Self::Restarting,
            _ => Self::Closed,
        }
    }
}

/// Why a session closed. Streams report it on their next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Local,
    ConnectionLost,
    Protocol,
    RestartFailed,
    HandedOff,
}

impl CloseReason {
    pub(crate) fn into_error(self) -> Error {
        match self {
            Self::RestartFailed => Error::HotRestart("hot restart failed".to_string()),
            Self::HandedOff => Error::HotRestart("session handed off to a successor".to_string()),
            Self::Local | Self::ConnectionLost | Self::Protocol => Error::ConnectionClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartPhase {
    Idle,
    /// This process is handing off.
    Local { epoch: u64, acked: bool },
    /// The peer is handing off; it must finish before `deadline`.
    Peer { epoch: u64, deadline: Instant },
}

pub(crate) struct ReadSide {
    pub conn: Box<dyn Transport>,
    pub buf: BytesMut,
}

#[derive(Debug)]
pub(crate) struct StreamTable {
    pub streams: HashMap<u32, Arc<StreamShared>>,
    /// Streams opened by the peer and not yet accepted.
    pub backlog: VecDeque<Arc<StreamShared>>,
    pub next_id: u32,
    /// Ids of our own streams that both sides closed.
    pub released: Vec<u32>,
}

impl StreamTable {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            streams: HashMap::new(),
            backlog: VecDeque::new(),
            next_id: role.first_stream_id(),
            released: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> Result<u32> {
        if let Some(id) = self.released.pop() {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id = id
            .checked_add(2)
            .ok_or_else(|| Error::Protocol("stream ids exhausted".to_string()))?;
        Ok(id)
    }
}

/// Everything needed to bring up a session after a handshake or handoff.
pub(crate) struct SessionParts {
    pub role: Role,
    pub version: u8,
    pub config: SessionConfig,
    pub buffers: BufferManager,
    pub queues: QueueFile,
    pub conn: Box<dyn Transport>,
    pub dispatcher: DispatcherHandle,
    pub streams: StreamTable,
    pub pending_input: BytesMut,
}

pub(crate) struct SessionInner {
    pub id: u64,
    pub role: Role,
    pub version: u8,
    pub config: SessionConfig,
    state: AtomicU8,
    pub buffers: BufferManager,
    pub queues: QueueFile,
    send_queue: Queue,
    recv_queue: Queue,
    pub producer: Mutex<Producer>,
    pub consumer: Mutex<Consumer>,
    /// Only the dispatcher thread reads, except during resume.
    pub reader: Mutex<ReadSide>,
    pub writer: Mutex<Box<dyn Transport>>,
    /// Frames queued by the dispatcher while a caller held the writer.
    outbox: Mutex<VecDeque<Vec<u8>>>,
    /// Used for registration, shutdown and descriptor passing.
    pub ctl: Box<dyn Transport>,
    pub transport_kind: TransportKind,
    pub streams: Mutex<StreamTable>,
    accept_cv: Condvar,
    pub restart: Mutex<RestartPhase>,
    pub restart_cv: Condvar,
    /// Set once the peer acknowledged our restart; nothing more may be
    /// written to the connection from this process.
    pub handing_off: AtomicBool,
    pub counters: SessionCounters,
    monitor: RwLock<Option<Arc<dyn Monitor>>>,
    last_emit: Mutex<Instant>,
    dispatcher: DispatcherHandle,
    token: Mutex<Option<Token>>,
    close_reason: Mutex<Option<CloseReason>>,
    self_ref: Weak<SessionInner>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    pub(crate) fn new(parts: SessionParts) -> Result<Arc<Self>> {
        let writer = parts.conn.try_clone_transport()?;
        let ctl = parts.conn.try_clone_transport()?;
        let transport_kind = parts.conn.kind();
        let role = parts.role;
        let active = parts.streams.streams.len() as u64;

        let inner = Arc::new_cyclic(|weak| Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            version: parts.version,
            config: parts.config,
            state: AtomicU8::new(SessionState::Connecting as u8),
            send_queue: parts.queues.queue(role.send_direction()),
            recv_queue: parts.queues.queue(role.recv_direction()),
            producer: Mutex::new(parts.queues.producer(role.send_direction())),
            consumer: Mutex::new(parts.queues.consumer(role.recv_direction())),
            buffers: parts.buffers,
            queues: parts.queues,
            reader: Mutex::new(ReadSide {
                conn: parts.conn,
                buf: parts.pending_input,
            }),
            writer: Mutex::new(writer),
            outbox: Mutex::new(VecDeque::new()),
            ctl,
            transport_kind,
            streams: Mutex::new(parts.streams),
            accept_cv: Condvar::new(),
            restart: Mutex::new(RestartPhase::Idle),
            restart_cv: Condvar::new(),
            handing_off: AtomicBool::new(false),
            counters: SessionCounters::default(),
            monitor: RwLock::new(None),
            last_emit: Mutex::new(Instant::now()),
            dispatcher: parts.dispatcher,
            token: Mutex::new(None),
            close_reason: Mutex::new(None),
            self_ref: weak.clone(),
        });
        inner.counters.active_streams.store(active, Ordering::Relaxed);
        Ok(inner)
    }

    /// Hand the control connection to the dispatcher.
    pub(crate) fn register(self: &Arc<Self>) -> Result<()> {
        let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        let token = self.dispatcher.register(self.ctl.as_raw_fd(), handler)?;
        *self.token.lock() = Some(token);
        Ok(())
    }

    pub(crate) fn deregister(&self) {
        if let Some(token) = self.token.lock().take() {
            self.dispatcher.deregister(token);
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails if the state changed meanwhile.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub(crate) fn close_reason(&self) -> CloseReason {
        self.close_reason.lock().unwrap_or(CloseReason::Local)
    }

    fn open_stream(&self) -> Result<Stream> {
        match self.state() {
            SessionState::Established | SessionState::Restarting => {}
            SessionState::Connecting => return Err(Error::ConnectionClosed),
            SessionState::Closed => return Err(self.close_reason().into_error()),
        }
        let shared = {
            let mut table = self.streams.lock();
            let id = table.allocate_id()?;
            let shared = StreamShared::new(id);
            table.streams.insert(id, Arc::clone(&shared));
            shared
        };
        SessionCounters::incr(&self.counters.active_streams);
        debug!(session = self.id, stream = shared.id, "stream opened");
        Ok(Stream::new(shared, self.self_ref.clone()))
    }

    fn accept_stream(&self, timeout: Option<Duration>) -> Result<Stream> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.streams.lock();
        loop {
            if let Some(shared) = table.backlog.pop_front() {
                return Ok(Stream::new(shared, self.self_ref.clone()));
            }
            if self.is_closed() {
                return Err(self.close_reason().into_error());
            }
            match deadline {
                Some(deadline) => {
                    if self.accept_cv.wait_until(&mut table, deadline).timed_out()
                        && table.backlog.is_empty()
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.accept_cv.wait(&mut table),
            }
        }
    }

    /// Register a stream opened by the peer.
    pub(crate) fn insert_peer_stream(&self, table: &mut StreamTable, id: u32) -> Arc<StreamShared> {
        let shared = StreamShared::new(id);
        table.streams.insert(id, Arc::clone(&shared));
        table.backlog.push_back(Arc::clone(&shared));
        SessionCounters::incr(&self.counters.active_streams);
        self.accept_cv.notify_one();
        debug!(session = self.id, stream = id, "stream opened by peer");
        shared
    }

    /// Forget a stream both sides closed; our own ids become reusable.
    pub(crate) fn release_stream(&self, id: u32) {
        let mut table = self.streams.lock();
        if table.streams.remove(&id).is_some() {
            table.backlog.retain(|s| s.id != id);
            if self.role.opens(id) {
                table.released.push(id);
            }
            SessionCounters::decr(&self.counters.active_streams);
            debug!(session = self.id, stream = id, "stream released");
        }
    }

    /// Tear the session down. Idempotent.
    ///
    /// Unless the session was handed off, the socket is shut down and every
    /// buffer this side still holds goes back to the free lists.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        self.deregister();

        if reason != CloseReason::HandedOff
            && let Err(e) = self.ctl.shutdown_both()
        {
            debug!(session = self.id, error = %e, "socket shutdown failed");
        }

        let streams: Vec<Arc<StreamShared>> = {
            let mut table = self.streams.lock();
            table.backlog.clear();
            table.streams.drain().map(|(_, s)| s).collect()
        };
        self.accept_cv.notify_all();
        self.counters.active_streams.store(0, Ordering::Relaxed);
        for stream in streams {
            stream.fail(reason);
        }

        if reason != CloseReason::HandedOff {
            self.free_unread();
        }
        if matches!(
            reason,
            CloseReason::ConnectionLost | CloseReason::Protocol | CloseReason::RestartFailed
        ) {
            self.reclaim_unsent();
        }

        {
            let _phase = self.restart.lock();
            self.restart_cv.notify_all();
        }

        match reason {
            CloseReason::Local | CloseReason::HandedOff => {
                info!(session = self.id, ?reason, "session closed");
            }
            _ => warn!(session = self.id, ?reason, "session closed"),
        }
        self.emit_metrics();
        if let Some(monitor) = self.monitor.read().as_ref() {
            monitor.flush();
        }
    }

    /// Free every descriptor still waiting on the receive queue.
    fn free_unread(&self) {
        let mut consumer = self.consumer.lock();
        loop {
            match consumer.try_dequeue() {
                Ok(Some(element)) => {
                    if let Err(e) = self.buffers.free(element.descriptor) {
                        warn!(session = self.id, error = %e, "failed to free unread buffer");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session = self.id, error = %e, "abandoning receive queue");
                    break;
                }
            }
        }
    }

    /// Free every descriptor we published that the peer never took.
    ///
    /// Only valid once the peer is gone: this consumes the peer's end of
    /// the send queue. A descriptor the peer frees at the same time is
    /// rejected as a double free by the slab state word.
    fn reclaim_unsent(&self) {
        let _producer = self.producer.lock();
        let mut consumer = self.queues.consumer(self.role.send_direction());
        let mut reclaimed = 0u64;
        loop {
            match consumer.try_dequeue() {
                Ok(Some(element)) => match self.buffers.free(element.descriptor) {
                    Ok(()) => reclaimed += 1,
                    Err(e) => debug!(session = self.id, error = %e, "unsent buffer already freed"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(session = self.id, error = %e, "abandoning send queue");
                    break;
                }
            }
        }
        if reclaimed > 0 {
            debug!(session = self.id, reclaimed, "reclaimed buffers the peer never read");
        }
    }

    pub(crate) fn snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            performance: self
                .counters
                .performance(self.send_queue.len(), self.recv_queue.len()),
            stability: self.counters.stability(),
            share_memory: self.buffers.metrics(),
        }
    }

    pub(crate) fn emit_metrics(&self) {
        let Some(monitor) = self.monitor.read().clone() else {
            return;
        };
        let snapshot = self.snapshot();
        monitor.on_emit(
            &snapshot.performance,
            &snapshot.stability,
            &snapshot.share_memory,
        );
    }

    /// Emit metrics if the interval elapsed since the last emission.
    fn maybe_emit_metrics(&self, now: Instant) {
        let due = {
            let mut last = self.last_emit.lock();
            if now.saturating_duration_since(*last) >= self.config.metrics_interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.emit_metrics();
        }
    }

    /// Record a failed hot restart and close the session.
    pub(crate) fn restart_failed(&self, message: String) -> Error {
        SessionCounters::incr(&self.counters.hot_restart_error);
        warn!(session = self.id, error = %message, "hot restart failed");
        self.shutdown(CloseReason::RestartFailed);
        Error::HotRestart(message)
    }
}

/// A shared-memory session with one peer process.
///
/// Dropping the session closes it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Session {
    /// Connect as the client over `conn`.
    ///
    /// Negotiates the protocol version, creates the shared segments and
    /// queue file under `config.shm_dir`, waits for the server to map them
    /// and registers the connection with `dispatcher`.
    pub fn client<T: Transport + 'static>(
        conn: T,
        config: SessionConfig,
        dispatcher: &DispatcherHandle,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let mut conn: Box<dyn Transport> = Box::new(conn);
        let (version, buffers, queues) = handshake::client(conn.as_mut(), &config)?;
        Self::establish(Role::Client, version, config, buffers, queues, conn, dispatcher)
    }

    /// Accept a session from a client over `conn`.
    pub fn server<T: Transport + 'static>(
        conn: T,
        config: SessionConfig,
        dispatcher: &DispatcherHandle,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let mut conn: Box<dyn Transport> = Box::new(conn);
        let (version, buffers, queues) = handshake::server(conn.as_mut(), &config)?;
        Self::establish(Role::Server, version, config, buffers, queues, conn, dispatcher)
    }

    fn establish(
        role: Role,
        version: u8,
        config: SessionConfig,
        buffers: BufferManager,
        queues: QueueFile,
        conn: Box<dyn Transport>,
        dispatcher: &DispatcherHandle,
    ) -> Result<Self> {
        let inner = SessionInner::new(SessionParts {
            role,
            version,
            config,
            buffers,
            queues,
            conn,
            dispatcher: dispatcher.clone(),
            streams: StreamTable::new(role),
            pending_input: BytesMut::new(),
        })?;
        inner.register()?;
        inner.transition(SessionState::Connecting, SessionState::Established);
        info!(session = inner.id, ?role, version, "session established");
        Ok(Self { inner })
    }

    /// Take over a session handed off by a predecessor process over
    /// `side_channel`. See [`crate::restart`].
    pub fn resume(
        side_channel: &UnixStream,
        config: SessionConfig,
        dispatcher: &DispatcherHandle,
    ) -> Result<Self> {
        let inner = crate::restart::resume(side_channel, config, dispatcher)?;
        Ok(Self { inner })
    }

    /// Hand this session to a successor process listening on
    /// `side_channel`. On success the session is closed here and lives on
    /// in the successor. See [`crate::restart`].
    pub fn hot_restart(&self, side_channel: &UnixStream) -> Result<()> {
        crate::restart::hand_off(&self.inner, side_channel)
    }

    /// Open a new stream.
    pub fn open_stream(&self) -> Result<Stream> {
        self.inner.open_stream()
    }

    /// Wait for a stream opened by the peer. `None` waits indefinitely.
    pub fn accept_stream(&self, timeout: Option<Duration>) -> Result<Stream> {
        self.inner.accept_stream(timeout)
    }

    /// Close the session. Open streams fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.shutdown(CloseReason::Local);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Process-local session id used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// This side's role.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> u8 {
        self.inner.version
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> SessionMetrics {
        self.inner.snapshot()
    }

    /// The session's buffer manager.
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.inner.buffers
    }

    /// Install the monitor receiving periodic metric snapshots.
    pub fn set_monitor(&self, monitor: Arc<dyn Monitor>) {
        *self.inner.monitor.write() = Some(monitor);
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.shutdown(CloseReason::Local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_by_role() {
        let mut client = StreamTable::new(Role::Client);
        assert_eq!(client.allocate_id().unwrap(), 1);
        assert_eq!(client.allocate_id().unwrap(), 3);
        client.released.push(1);
        assert_eq!(client.allocate_id().unwrap(), 1);
        assert_eq!(client.allocate_id().unwrap(), 5);

        let mut server = StreamTable::new(Role::Server);
        assert_eq!(server.allocate_id().unwrap(), 2);
        assert_eq!(server.allocate_id().unwrap(), 4);
    }

    #[test]
    fn test_id_space_exhaustion() {
        let mut table = StreamTable::new(Role::Client);
        table.next_id = u32::MAX;
        assert!(matches!(table.allocate_id(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_role_owns_parity() {
        assert!(Role::Client.opens(1));
        assert!(!Role::Client.opens(2));
        assert!(Role::Server.opens(2));
        assert!(!Role::Server.opens(7));
        assert_eq!(Role::try_from(1).unwrap(), Role::Server);
        assert!(Role::try_from(9).is_err());
    }

    #[test]
    fn test_close_reason_errors() {
        assert!(matches!(
            CloseReason::ConnectionLost.into_error(),
            Error::ConnectionClosed
        ));
        assert!(CloseReason::HandedOff.into_error().is_recoverable());
    }
}
