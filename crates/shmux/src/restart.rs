//! Hot restart: handing a live session to a successor process.
//!
//! The process giving up the session announces `HotRestart` to its peer and
//! waits for `HotRestartAck`. From then on it neither reads nor writes the
//! control connection. It serializes everything the successor needs into a
//! [`HandoffRecord`] and sends it, together with the control socket, over a
//! Unix side channel:
//!
//! ```text
//! len:u32 | md5(body):[u8; 16] | body
//! ```
//!
//! `len` is the body length, big-endian. The socket descriptor travels as
//! `SCM_RIGHTS` ancillary data on the first bytes. The successor verifies
//! the frame, maps the same files, takes over the buffers the record names
//! and tells the peer `HotRestartDone`.
//!
//! A transfer happens at most once. Any failure closes the session on the
//! side that noticed it; the peer sees the connection drop or its restart
//! deadline pass.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{self, Cursor, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use binrw::{BinRead, BinWrite};
use bytes::{Bytes, BytesMut};
use rand::{RngExt, rng};
use tracing::{debug, info, warn};

use crate::buffer::{BufferDescriptor, BufferManager};
use crate::config::SessionConfig;
use crate::metrics::SessionCounters;
use crate::poller::DispatcherHandle;
use crate::protocol::{Event, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, RestartEvent};
use crate::queue::QueueFile;
use crate::session::{
    CloseReason, RestartPhase, Role, SessionInner, SessionParts, SessionState, StreamTable,
};
use crate::stream::{Chunk, StreamShared, StreamState};
use crate::transport::{TransportKind, transport_from_fd};
use crate::{Error, Result};

/// Magic at the start of a handoff record body.
pub const RECORD_MAGIC: [u8; 8] = *b"SHMXHOFF";

/// Handoff record layout version.
pub const RECORD_VERSION: u16 = 1;

/// Largest record body accepted.
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Length and checksum in front of the body.
const FRAME_PREFIX: usize = 4 + 16;

const LOCAL_CLOSED: u8 = 0x01;
const REMOTE_CLOSED: u8 = 0x02;
/// Closed locally after the restart ack; the peer was not told yet.
const CLOSE_PENDING: u8 = 0x04;

/// One buffered, unread chunk of a stream.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub(crate) enum ChunkRecord {
    /// A shared-memory slab, of which `pos` bytes were read.
    #[brw(magic = 0u8)]
    Shm {
        segment_id: u32,
        offset: u32,
        length: u32,
        pos: u32,
    },
    /// Bytes that arrived over the control connection.
    #[brw(magic = 1u8)]
    Inline {
        len: u32,
        #[br(count = len)]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub(crate) struct StreamRecord {
    pub id: u32,
    pub flags: u8,
    pub chunk_count: u32,
    #[br(count = chunk_count)]
    pub chunks: Vec<ChunkRecord>,
}

/// Everything a successor needs to continue a session.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big, magic = b"SHMXHOFF")]
pub(crate) struct HandoffRecord {
    #[br(assert(version == RECORD_VERSION, "unsupported handoff record version {}", version))]
    pub version: u16,
    pub epoch: u64,
    pub role: u8,
    pub proto_version: u8,
    pub transport_kind: u8,
    /// Non-zero if this side unlinks the queue file.
    pub queue_owner: u8,
    pub queue_path_len: u16,
    #[br(count = queue_path_len)]
    pub queue_path: Vec<u8>,
    pub prefix_len: u16,
    #[br(count = prefix_len)]
    pub prefix: Vec<u8>,
    pub owned_segment_count: u32,
    #[br(count = owned_segment_count)]
    pub owned_segments: Vec<u32>,
    pub next_stream_id: u32,
    pub released_count: u32,
    #[br(count = released_count)]
    pub released_ids: Vec<u32>,
    pub stream_count: u32,
    #[br(count = stream_count)]
    pub streams: Vec<StreamRecord>,
    pub pending_len: u32,
    #[br(count = pending_len)]
    pub pending_input: Vec<u8>,
}

impl HandoffRecord {
    /// Serialize and frame the record.
    pub(crate) fn to_frame(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)
            .map_err(|e| Error::HotRestart(format!("failed to encode handoff record: {e}")))?;
        let body = cursor.into_inner();
        if body.len() > MAX_RECORD_SIZE {
            return Err(Error::HotRestart(format!(
                "handoff record of {} bytes exceeds {MAX_RECORD_SIZE}",
                body.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_PREFIX + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&md5::compute(&body).0);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Verify the checksum of `body` against `digest` and parse it.
    pub(crate) fn from_body(digest: &[u8; 16], body: &[u8]) -> Result<Self> {
        if md5::compute(body).0 != *digest {
            return Err(Error::HotRestart(
                "handoff record checksum mismatch".to_string(),
            ));
        }
        let mut cursor = Cursor::new(body);
        let record = Self::read(&mut cursor)
            .map_err(|e| Error::HotRestart(format!("malformed handoff record: {e}")))?;
        if cursor.position() as usize != body.len() {
            return Err(Error::HotRestart(format!(
                "{} trailing bytes after handoff record",
                body.len() - cursor.position() as usize
            )));
        }
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&record.proto_version) {
            return Err(Error::HotRestart(format!(
                "handoff record carries protocol version {}",
                record.proto_version
            )));
        }
        Ok(record)
    }

    /// Rebuild the stream table. Shared-memory chunks are claimed here.
    fn restore_streams(&self, role: Role, buffers: &BufferManager) -> Result<StreamTable> {
        let mut table = StreamTable::new(role);
        table.next_id = self.next_stream_id;
        table.released.clone_from(&self.released_ids);

        for record in &self.streams {
            let mut chunks = VecDeque::with_capacity(record.chunks.len());
            for chunk in &record.chunks {
                chunks.push_back(match chunk {
                    ChunkRecord::Shm {
                        segment_id,
                        offset,
                        length,
                        pos,
                    } => {
                        let buf = buffers.claim(BufferDescriptor {
                            segment_id: *segment_id,
                            offset: *offset,
                            length: *length,
                        })?;
                        if *pos > *length {
                            return Err(Error::HotRestart(format!(
                                "stream {} chunk read past its end",
                                record.id
                            )));
                        }
                        Chunk::Shm {
                            buf,
                            pos: *pos as usize,
                        }
                    }
                    ChunkRecord::Inline { data, .. } => Chunk::Inline(Bytes::copy_from_slice(data)),
                });
            }
            let local_closed = record.flags & LOCAL_CLOSED != 0;
            let state = StreamState {
                chunks,
                local_closed,
                close_announced: local_closed && record.flags & CLOSE_PENDING == 0,
                remote_closed: record.flags & REMOTE_CLOSED != 0,
                ..StreamState::default()
            };
            let shared = StreamShared::with_state(record.id, state);
            if !local_closed {
                table.backlog.push_back(Arc::clone(&shared));
            }
            table.streams.insert(record.id, shared);
        }
        Ok(table)
    }
}

/// Hand `inner` to the successor listening on `side`.
pub(crate) fn hand_off(inner: &Arc<SessionInner>, side: &UnixStream) -> Result<()> {
    let epoch = rng().random::<u64>();
    {
        let mut phase = inner.restart.lock();
        if inner.state() != SessionState::Established || *phase != RestartPhase::Idle {
            return Err(Error::HotRestart(format!(
                "cannot restart a session in state {:?}",
                inner.state()
            )));
        }
        *phase = RestartPhase::Local {
            epoch,
            acked: false,
        };
        inner.set_state(SessionState::Restarting);
    }
    info!(session = inner.id, epoch, "starting hot restart");

    if let Err(e) = inner.send_event(&Event::HotRestart(RestartEvent { epoch }), None) {
        return Err(inner.restart_failed(format!("failed to announce restart: {e}")));
    }
    wait_for_ack(inner, epoch)?;

    let (streams, pending) = match transfer(inner, side, epoch) {
        Ok(sent) => sent,
        Err(Error::HotRestart(message)) => return Err(inner.restart_failed(message)),
        Err(e) => return Err(inner.restart_failed(e.to_string())),
    };
    SessionCounters::incr(&inner.counters.hot_restart_success);
    info!(session = inner.id, epoch, streams, pending, "session handed off");
    inner.shutdown(CloseReason::HandedOff);
    Ok(())
}

/// Build and send the record. Returns the number of streams and pending
/// input bytes transferred.
fn transfer(inner: &SessionInner, side: &UnixStream, epoch: u64) -> Result<(usize, usize)> {
    side.set_write_timeout(Some(inner.config.hot_restart_timeout))?;

    // Nothing may be written to the connection from here on, and the
    // dispatcher has stopped reading it.
    let _writer = inner.writer.lock();
    let read = inner.reader.lock();
    let (record, taken) = build_record(inner, epoch, &read.buf)?;
    let frame = record.to_frame()?;

    // On failure the taken chunks are freed; the successor may hold part of
    // the record, so the session fails closed.
    send_with_fd(side, &frame, inner.ctl.as_raw_fd())
        .map_err(|e| Error::HotRestart(format!("failed to send handoff record: {e}")))?;

    // The successor owns these buffers and files now.
    for chunk in taken.into_iter().flatten() {
        if let Chunk::Shm { buf, .. } = chunk {
            let _ = buf.into_descriptor();
        }
    }
    inner.buffers.retain_files();
    inner.queues.retain();
    Ok((record.streams.len(), record.pending_input.len()))
}

fn wait_for_ack(inner: &SessionInner, epoch: u64) -> Result<()> {
    let deadline = Instant::now() + inner.config.hot_restart_timeout;
    let mut phase = inner.restart.lock();
    loop {
        if matches!(*phase, RestartPhase::Local { epoch: e, acked: true } if e == epoch) {
            return Ok(());
        }
        if inner.is_closed() {
            drop(phase);
            SessionCounters::incr(&inner.counters.hot_restart_error);
            return Err(Error::HotRestart(
                "session closed while waiting for the restart ack".to_string(),
            ));
        }
        if inner.restart_cv.wait_until(&mut phase, deadline).timed_out() {
            let acked = matches!(*phase, RestartPhase::Local { acked: true, .. });
            drop(phase);
            if acked {
                return Ok(());
            }
            return Err(inner.restart_failed("peer did not acknowledge the restart".to_string()));
        }
    }
}

/// Snapshot the session. Buffered chunks are taken out of their streams so
/// local readers cannot consume what the successor will deliver.
fn build_record(
    inner: &SessionInner,
    epoch: u64,
    pending: &BytesMut,
) -> Result<(HandoffRecord, Vec<VecDeque<Chunk>>)> {
    let queue_path = inner.queues.path().as_os_str().as_bytes().to_vec();
    let prefix = inner.buffers.prefix().as_os_str().as_bytes().to_vec();
    let (Ok(queue_path_len), Ok(prefix_len)) = (
        u16::try_from(queue_path.len()),
        u16::try_from(prefix.len()),
    ) else {
        return Err(Error::HotRestart("share memory path too long".to_string()));
    };
    let owned_segments = inner.buffers.owned_segments();

    let table = inner.streams.lock();
    let mut streams = Vec::with_capacity(table.streams.len());
    let mut taken = Vec::with_capacity(table.streams.len());

    let mut ids: Vec<u32> = table.streams.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let Some(stream) = table.streams.get(&id) else {
            continue;
        };
        let mut state = stream.state.lock();
        let chunks = std::mem::take(&mut state.chunks);
        let mut flags = 0;
        if state.local_closed {
            flags |= LOCAL_CLOSED;
            if !state.close_announced {
                flags |= CLOSE_PENDING;
            }
        }
        if state.remote_closed {
            flags |= REMOTE_CLOSED;
        }
        drop(state);

        let records: Vec<ChunkRecord> = chunks.iter().map(chunk_record).collect();
        streams.push(StreamRecord {
            id,
            flags,
            chunk_count: records.len() as u32,
            chunks: records,
        });
        taken.push(chunks);
    }

    let record = HandoffRecord {
        version: RECORD_VERSION,
        epoch,
        role: inner.role as u8,
        proto_version: inner.version,
        transport_kind: inner.transport_kind as u8,
        queue_owner: u8::from(inner.queues.is_owner()),
        queue_path_len,
        queue_path,
        prefix_len,
        prefix,
        owned_segment_count: owned_segments.len() as u32,
        owned_segments,
        next_stream_id: table.next_id,
        released_count: table.released.len() as u32,
        released_ids: table.released.clone(),
        stream_count: streams.len() as u32,
        streams,
        pending_len: pending.len() as u32,
        pending_input: pending.to_vec(),
    };
    Ok((record, taken))
}

fn chunk_record(chunk: &Chunk) -> ChunkRecord {
    match chunk {
        Chunk::Shm { buf, pos } => {
            let desc = buf.descriptor();
            ChunkRecord::Shm {
                segment_id: desc.segment_id,
                offset: desc.offset,
                length: desc.length,
                pos: *pos as u32,
            }
        }
        Chunk::Inline(bytes) => ChunkRecord::Inline {
            len: bytes.len() as u32,
            data: bytes.to_vec(),
        },
    }
}

/// Take over a session from the predecessor sending on `side`.
pub(crate) fn resume(
    side: &UnixStream,
    config: SessionConfig,
    dispatcher: &DispatcherHandle,
) -> Result<Arc<SessionInner>> {
    config.validate().map_err(Error::Config)?;
    side.set_read_timeout(Some(config.hot_restart_timeout))?;

    let (frame, fd) = recv_with_fd(side)?;
    let record = HandoffRecord::from_body(&frame.digest, &frame.body)?;
    let role = Role::try_from(record.role)?;
    let kind = TransportKind::try_from(record.transport_kind)?;
    let conn = transport_from_fd(kind, fd);

    let queue_path = Path::new(OsStr::from_bytes(&record.queue_path));
    let prefix = Path::new(OsStr::from_bytes(&record.prefix));
    let queues = QueueFile::open(queue_path)?;
    let buffers = BufferManager::attach(prefix)?;
    buffers.adopt_segments(&record.owned_segments)?;
    if record.queue_owner != 0 {
        queues.adopt();
    }
    let streams = record.restore_streams(role, &buffers)?;
    conn.set_nonblocking_mode(true)?;

    let inner = SessionInner::new(SessionParts {
        role,
        version: record.proto_version,
        config,
        buffers,
        queues,
        conn,
        dispatcher: dispatcher.clone(),
        streams,
        pending_input: BytesMut::from(&record.pending_input[..]),
    })?;

    if let Err(e) = complete(&inner, record.epoch) {
        return Err(inner.restart_failed(format!("failed to resume session: {e}")));
    }
    info!(
        session = inner.id,
        epoch = record.epoch,
        ?role,
        streams = record.streams.len(),
        "session resumed"
    );
    Ok(inner)
}

fn complete(inner: &Arc<SessionInner>, epoch: u64) -> Result<()> {
    {
        let mut read = inner.reader.lock();
        inner.process_input(&mut read)?;
    }
    inner.register()?;
    inner.transition(SessionState::Connecting, SessionState::Established);
    inner.send_event(&Event::HotRestartDone(RestartEvent { epoch }), None)?;
    inner.announce_inherited_closes()?;
    // The predecessor may have published entries without waking the peer.
    inner.send_event(&Event::Polling, None)?;
    SessionCounters::incr(&inner.counters.hot_restart_success);
    Ok(())
}

/// A received frame, before parsing.
pub(crate) struct RecordFrame {
    pub digest: [u8; 16],
    pub body: Vec<u8>,
}

/// Write `frame` to `side`, attaching `fd` to the first bytes.
pub(crate) fn send_with_fd(side: &UnixStream, frame: &[u8], fd: RawFd) -> io::Result<()> {
    let sent = sendmsg_fd(side.as_raw_fd(), frame, fd)?;
    if sent == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "side channel accepted no bytes",
        ));
    }
    let mut writer = side;
    writer.write_all(&frame[sent..])?;
    writer.flush()
}

/// Read one frame and the descriptor attached to it.
pub(crate) fn recv_with_fd(side: &UnixStream) -> Result<(RecordFrame, OwnedFd)> {
    let mut prefix = [0u8; FRAME_PREFIX];
    let (received, fd) = recvmsg_fd(side.as_raw_fd(), &mut prefix).map_err(side_io)?;
    if received == 0 {
        return Err(Error::HotRestart(
            "side channel closed before a handoff record arrived".to_string(),
        ));
    }
    let Some(fd) = fd else {
        return Err(Error::HotRestart(
            "handoff record arrived without a control socket".to_string(),
        ));
    };

    let mut reader = side;
    reader
        .read_exact(&mut prefix[received..])
        .map_err(side_io)?;
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(Error::HotRestart(format!(
            "handoff record of {len} bytes exceeds {MAX_RECORD_SIZE}"
        )));
    }
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&prefix[4..]);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(side_io)?;
    debug!(len, "received handoff record");
    Ok((RecordFrame { digest, body }, fd))
}

fn side_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            Error::HotRestart("timed out reading the handoff record".to_string())
        }
        _ => Error::HotRestart(format!("side channel failed: {e}")),
    }
}

/// Control buffer for up to four descriptors, aligned for `cmsghdr`.
type ControlBuf = [u64; 8];

#[allow(unsafe_code)]
fn sendmsg_fd(socket: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: a zeroed msghdr is valid before its pointers are assigned.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    // SAFETY: CMSG_SPACE only computes a size.
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as _;

    // SAFETY: the control buffer is larger than CMSG_SPACE for one fd and
    // outlives the call; the iovec points at `data`.
    let sent = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null() {
            return Err(io::Error::other("no room for SCM_RIGHTS header"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
        libc::CMSG_DATA(cmsg).cast::<RawFd>().write_unaligned(fd);
        loop {
            let n = libc::sendmsg(socket, &raw const msg, send_flags());
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    };
    Ok(sent as usize)
}

#[allow(unsafe_code)]
fn recvmsg_fd(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: a zeroed msghdr is valid before its pointers are assigned.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = size_of::<ControlBuf>() as _;

    // SAFETY: msg points at live iovec and control buffers.
    let received = loop {
        let n = unsafe { libc::recvmsg(socket, &raw mut msg, recv_flags()) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    // SAFETY: the kernel filled the control buffer described by msg; every
    // descriptor in an SCM_RIGHTS message is newly installed and ours.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..payload / size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }
    if fds.len() > 1 {
        warn!(count = fds.len(), "closing unexpected descriptors");
    }
    Ok((received, fds.into_iter().next()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const fn send_flags() -> libc::c_int {
    0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const fn recv_flags() -> libc::c_int {
    libc::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const fn recv_flags() -> libc::c_int {
    0
}
