//! Streams multiplexed inside a session.
//!
//! A [`Stream`] is a blocking byte stream. Incoming chunks are queued on the
//! stream by the dispatcher thread, either as shared-memory buffers read in
//! place or as inline bytes that arrived over the control connection. Reads
//! and writes honour per-direction deadlines that can be re-armed at any
//! time.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::buffer::ShmBuffer;
use crate::session::{CloseReason, SessionInner};
use crate::{Error, Result};

/// One received chunk waiting to be read.
pub(crate) enum Chunk {
    /// Bytes in a shared-memory slab; `pos` bytes were already read.
    Shm { buf: ShmBuffer, pos: usize },
    /// Bytes received over the control connection.
    Inline(Bytes),
}

impl Chunk {
    fn remaining(&self) -> &[u8] {
        match self {
            Self::Shm { buf, pos } => &buf.as_slice()[*pos..],
            Self::Inline(bytes) => bytes,
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            Self::Shm { pos, .. } => *pos += n,
            Self::Inline(bytes) => bytes.advance(n),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.remaining().len()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shm { buf, pos } => f
                .debug_struct("Shm")
                .field("descriptor", &buf.descriptor())
                .field("pos", pos)
                .finish(),
            Self::Inline(bytes) => f.debug_tuple("Inline").field(&bytes.len()).finish(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub chunks: VecDeque<Chunk>,
    pub local_closed: bool,
    /// `StreamClose` went out for the local close.
    pub close_announced: bool,
    pub remote_closed: bool,
    pub failure: Option<CloseReason>,
    pub read_deadline: Option<Instant>,
    pub write_deadline: Option<Instant>,
}

impl StreamState {
    pub fn buffered(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }
}

/// State shared between a [`Stream`] handle and its session.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub id: u32,
    pub state: Mutex<StreamState>,
    pub readable: Condvar,
    /// Serializes writers so a stream's chunks keep their order.
    pub write_lock: Mutex<()>,
}

impl StreamShared {
    pub fn new(id: u32) -> Arc<Self> {
        Self::with_state(id, StreamState::default())
    }

    pub fn with_state(id: u32, state: StreamState) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(state),
            readable: Condvar::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Queue a received chunk. The queue is unbounded. Chunks for a stream
    /// closed locally or failed are dropped, which frees their slab.
    pub fn push(&self, chunk: Chunk) -> bool {
        let mut state = self.state.lock();
        if state.local_closed || state.failure.is_some() {
            return false;
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.readable.notify_all();
        true
    }

    /// Record the peer's close. Returns `true` if the stream was already
    /// closed locally, i.e. both sides are done with the id.
    pub fn mark_remote_closed(&self) -> bool {
        let mut state = self.state.lock();
        state.remote_closed = true;
        let local_closed = state.local_closed;
        drop(state);
        self.readable.notify_all();
        local_closed
    }

    /// Fail the stream because its session went away.
    pub fn fail(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
        if reason != CloseReason::HandedOff {
            state.chunks.clear();
        }
        drop(state);
        self.readable.notify_all();
    }
}

/// A bidirectional byte stream inside a session.
///
/// Reads and writes may run concurrently from different threads through
/// `&Stream`. Dropping the handle closes the stream.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Weak<SessionInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish()
    }
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Weak<SessionInner>) -> Self {
        Self { shared, session }
    }

    /// Stream id. Client-opened streams are odd, server-opened even.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Read into `buf`.
    ///
    /// Blocks until data is available, the peer closed the stream (`Ok(0)`)
    /// or the read deadline passes. A deadline already in the past fails
    /// with [`Error::Timeout`] even when data is buffered; the data stays
    /// readable once the deadline is re-armed.
    ///
    /// Received chunks queue without limit until read. There is no
    /// read-side flow control: a stream nobody reads keeps every slab the
    /// peer sent it, and once the slabs run out the peer's writes spill onto
    /// the control connection and buffer here instead.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if let Some(deadline) = state.read_deadline
                && Instant::now() >= deadline
            {
                return Err(Error::Timeout);
            }
            if state.local_closed {
                return Err(Error::StreamClosed);
            }
            if !state.chunks.is_empty() {
                return Ok(copy_out(&mut state.chunks, buf));
            }
            if let Some(reason) = state.failure {
                return Err(reason.into_error());
            }
            if state.remote_closed {
                return Ok(0);
            }
            match state.read_deadline {
                Some(deadline) => {
                    let _ = self.shared.readable.wait_until(&mut state, deadline);
                }
                None => self.shared.readable.wait(&mut state),
            }
        }
    }

    /// Write `data`, returning how many bytes were accepted.
    ///
    /// Large writes are split into chunks of at most the largest slab size.
    /// The write deadline is checked before each chunk; if it passes after
    /// some chunks went out, the count written so far is returned.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let session = self.session.upgrade().ok_or(Error::ConnectionClosed)?;
        let _writer = self.shared.write_lock.lock();
        let deadline = {
            let state = self.shared.state.lock();
            if state.local_closed {
                return Err(Error::StreamClosed);
            }
            if let Some(reason) = state.failure {
                return Err(reason.into_error());
            }
            state.write_deadline
        };
        session.write_stream(&self.shared, data, deadline)
    }

    /// Set the deadline for reads; `None` disables it. Blocked readers
    /// re-evaluate immediately.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().read_deadline = deadline;
        self.shared.readable.notify_all();
    }

    /// Set the deadline for writes; `None` disables it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().write_deadline = deadline;
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        {
            let mut state = self.shared.state.lock();
            state.read_deadline = deadline;
            state.write_deadline = deadline;
        }
        self.shared.readable.notify_all();
    }

    /// Bytes received and not yet read.
    pub fn buffered_len(&self) -> usize {
        self.shared.state.lock().buffered()
    }

    /// Whether [`Stream::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().local_closed
    }

    /// Close the stream. Idempotent.
    ///
    /// Unread data is discarded and the peer is told with `StreamClose`.
    /// The id becomes reusable once the peer has closed its end too.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.local_closed {
                return Ok(());
            }
            state.local_closed = true;
            state.chunks.clear();
        }
        self.shared.readable.notify_all();
        debug!(stream = self.shared.id, "stream closed locally");
        match self.session.upgrade() {
            Some(session) => session.close_stream(&self.shared),
            None => Ok(()),
        }
    }
}

fn copy_out(chunks: &mut VecDeque<Chunk>, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let Some(front) = chunks.front_mut() else {
            break;
        };
        let src = front.remaining();
        let n = src.len().min(buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&src[..n]);
        copied += n;
        front.advance(n);
        if front.len() == 0 {
            chunks.pop_front();
        }
    }
    copied
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(stream = self.shared.id, error = %e, "close on drop failed");
        }
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Self::read(self, buf).map_err(Into::into)
    }
}

impl io::Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(*self, buf).map_err(Into::into)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Self::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(*self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
