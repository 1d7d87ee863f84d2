//! Send path.
//!
//! Stream chunks go through shared memory when a slab and a queue slot are
//! available and through `FallbackData` frames otherwise. Frames are written
//! whole under the writer lock. The dispatcher never blocks on that lock:
//! its replies go to an outbox that whoever holds the writer flushes.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, warn};

use super::{CloseReason, RestartPhase, SessionInner, SessionState};
use crate::metrics::SessionCounters;
use crate::protocol::{Event, MAX_FALLBACK_PAYLOAD, STREAM_EVENT_SIZE, encode_fallback_data};
use crate::stream::StreamShared;
use crate::transport::{Transport, write_all_until};
use crate::{Error, Result};

impl SessionInner {
    /// Whether data may be written now. `Ok(true)` means the peer is
    /// restarting and only fallback frames may be used.
    fn check_writable(&self) -> Result<bool> {
        match self.state() {
            SessionState::Established => Ok(false),
            SessionState::Restarting => match *self.restart.lock() {
                RestartPhase::Peer { .. } => Ok(true),
                RestartPhase::Local { .. } => Err(Error::HotRestart(
                    "session is being handed to a successor".to_string(),
                )),
                // Between the restart phase clearing and the state flip.
                RestartPhase::Idle => Ok(false),
            },
            SessionState::Connecting => Err(Error::ConnectionClosed),
            SessionState::Closed => Err(self.close_reason().into_error()),
        }
    }

    /// Write `data` on behalf of `stream`. The caller holds the stream's
    /// write lock.
    pub(crate) fn write_stream(
        &self,
        stream: &StreamShared,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let max_chunk = self.buffers.max_alloc_size().clamp(1, MAX_FALLBACK_PAYLOAD);
        let mut written = 0;
        for chunk in data.chunks(max_chunk) {
            let outcome = self.write_chunk(stream.id, chunk, deadline);
            match outcome {
                Ok(()) => {
                    written += chunk.len();
                    SessionCounters::add(&self.counters.out_flow_bytes, chunk.len() as u64);
                }
                Err(e) if written > 0 && e.is_recoverable() => return Ok(written),
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn write_chunk(&self, stream_id: u32, chunk: &[u8], deadline: Option<Instant>) -> Result<()> {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Timeout);
        }
        let peer_restarting = self.check_writable()?;
        if !peer_restarting {
            match self.try_send_shm(stream_id, chunk) {
                Ok(()) => return Ok(()),
                Err(e @ (Error::AllocShm { .. } | Error::QueueFull)) => {
                    debug!(session = self.id, error = %e, "falling back to the control connection");
                }
                Err(e) => return Err(e),
            }
        }
        self.send_fallback(stream_id, chunk, deadline)
    }

    /// Publish `chunk` through shared memory. [`Error::AllocShm`] and
    /// [`Error::QueueFull`] mean the chunk has to take the fallback path.
    fn try_send_shm(&self, stream_id: u32, chunk: &[u8]) -> Result<()> {
        let mut buf = self.buffers.allocate(chunk.len()).inspect_err(|_| {
            SessionCounters::incr(&self.counters.alloc_shm_error);
        })?;
        buf.fill(chunk);

        let notify = {
            let mut producer = self.producer.lock();
            if !producer.try_enqueue(stream_id, buf.descriptor()) {
                SessionCounters::incr(&self.counters.queue_full_error);
                return Err(Error::QueueFull);
            }
            // The peer owns the slab from here on.
            let _ = buf.into_descriptor();
            producer.needs_notify()
        };

        if notify {
            match self.send_event(&Event::Polling, None) {
                Ok(()) => SessionCounters::incr(&self.counters.send_sync_event),
                // The entry is published; the successor wakes the peer.
                Err(Error::HotRestart(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn send_fallback(&self, stream_id: u32, chunk: &[u8], deadline: Option<Instant>) -> Result<()> {
        let watermark = self.producer.lock().tail() as u32;
        let length = (STREAM_EVENT_SIZE + chunk.len()) as u32;
        let mut frame = Vec::with_capacity(length as usize);
        frame.extend_from_slice(&encode_fallback_data(
            length,
            self.version,
            stream_id,
            watermark,
        )?);
        frame.extend_from_slice(chunk);
        self.send_frame(&frame, deadline)?;
        SessionCounters::incr(&self.counters.fallback_write);
        Ok(())
    }

    /// Tell the peer a stream was closed here and release the id if the
    /// peer closed it too.
    ///
    /// Once a handoff is under way the close is left unannounced; the
    /// handoff record carries it and the successor sends it.
    pub(crate) fn close_stream(&self, stream: &StreamShared) -> Result<()> {
        let _writer = stream.write_lock.lock();
        let remote_closed = stream.state.lock().remote_closed;
        let result = if self.is_closed() {
            Ok(())
        } else {
            match self.announce_close(stream) {
                Err(Error::HotRestart(_)) if self.handing_off.load(Ordering::Acquire) => Ok(()),
                other => other,
            }
        };
        if remote_closed {
            self.release_stream(stream.id);
        }
        result
    }

    /// Send `StreamClose`. The announcement is recorded under the writer
    /// lock, which a handoff holds while it snapshots the streams.
    fn announce_close(&self, stream: &StreamShared) -> Result<()> {
        self.with_writer(None, |writer| {
            let watermark = self.producer.lock().tail() as u32;
            let frame = Event::StreamClose {
                stream_id: stream.id,
                watermark,
            }
            .encode(self.version)?;
            stream.state.lock().close_announced = true;
            self.write_locked(writer, &frame)
        })
    }

    /// Announce closes a predecessor made during its handoff.
    pub(crate) fn announce_inherited_closes(&self) -> Result<()> {
        let pending: Vec<Arc<StreamShared>> = self
            .streams
            .lock()
            .streams
            .values()
            .filter(|s| {
                let state = s.state.lock();
                state.local_closed && !state.close_announced
            })
            .cloned()
            .collect();
        for stream in pending {
            debug!(session = self.id, stream = stream.id, "announcing inherited close");
            self.close_stream(&stream)?;
        }
        Ok(())
    }

    pub(crate) fn send_event(&self, event: &Event, deadline: Option<Instant>) -> Result<()> {
        let frame = event.encode(self.version)?;
        self.send_frame(&frame, deadline)
    }

    /// Write one frame from a caller thread.
    ///
    /// `deadline` bounds waiting for the writer; once the first byte is out
    /// the frame is finished within `write_timeout` or the session fails.
    fn send_frame(&self, frame: &[u8], deadline: Option<Instant>) -> Result<()> {
        self.with_writer(deadline, |writer| self.write_locked(writer, frame))
    }

    /// Run `write` under the writer lock, then flush the outbox.
    fn with_writer<F>(&self, deadline: Option<Instant>, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Transport) -> Result<()>,
    {
        let mut writer = match deadline {
            Some(deadline) => self
                .writer
                .try_lock_until(deadline)
                .ok_or(Error::Timeout)?,
            None => self.writer.lock(),
        };
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Timeout);
        }
        self.ensure_can_send()?;

        let result = write(writer.as_mut()).and_then(|()| self.flush_outbox(writer.as_mut()));
        drop(writer);
        let result = result.and_then(|()| self.flush_control_if_idle());
        if let Err(e) = &result {
            self.write_failed(e);
        }
        result
    }

    /// Queue a frame from the dispatcher thread without blocking on the
    /// writer.
    pub(crate) fn send_control(&self, event: &Event) -> Result<()> {
        let frame = event.encode(self.version)?;
        self.outbox.lock().push_back(frame);
        self.flush_control_if_idle()
    }

    fn flush_control_if_idle(&self) -> Result<()> {
        if self.outbox.lock().is_empty() {
            return Ok(());
        }
        let Some(mut writer) = self.writer.try_lock() else {
            // The holder flushes before it lets go.
            return Ok(());
        };
        self.ensure_can_send()?;
        self.flush_outbox(writer.as_mut())
    }

    fn flush_outbox(&self, writer: &mut dyn Transport) -> Result<()> {
        loop {
            let Some(frame) = self.outbox.lock().pop_front() else {
                return Ok(());
            };
            self.write_locked(writer, &frame)?;
        }
    }

    fn ensure_can_send(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.close_reason().into_error());
        }
        if self.handing_off.load(Ordering::Acquire) {
            return Err(Error::HotRestart(
                "session was handed to a successor".to_string(),
            ));
        }
        Ok(())
    }

    fn write_locked(&self, writer: &mut dyn Transport, frame: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.config.write_timeout;
        match write_all_until(writer, frame, deadline) {
            Err(Error::Timeout) => Err(Error::EventConn(
                "control frame not written within write_timeout".to_string(),
            )),
            other => other,
        }
    }

    /// A frame could not be written: the connection is unusable.
    fn write_failed(&self, err: &Error) {
        if matches!(err, Error::EventConn(_) | Error::Io(_)) && !self.is_closed() {
            SessionCounters::incr(&self.counters.event_conn_error);
            warn!(session = self.id, error = %err, "control connection write failed");
            self.shutdown(CloseReason::ConnectionLost);
        }
    }
}
