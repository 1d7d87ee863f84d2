//! Receive path, run on the dispatcher thread.
//!
//! Each pass snapshots the receive queue's tail, reads the socket until it
//! would block, applies the frames in order and finally drains the queue up
//! to the snapshot. Frames carrying a watermark drain up to it first. A
//! sender finishes writing a fallback frame before it publishes anything
//! newer on the queue, so a queue entry below the snapshot never overtakes
//! a frame written before it.

use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{CloseReason, ReadSide, RestartPhase, SessionInner, SessionState};
use crate::metrics::SessionCounters;
use crate::poller::EventHandler;
use crate::protocol::{Event, MAX_FRAME_SIZE, RestartEvent, parse_frame, peek_frame_len};
use crate::queue::QueueElement;
use crate::stream::Chunk;
use crate::{Error, Result};

/// Bytes read from the socket per call.
const READ_CHUNK: usize = 64 * 1024;

/// Input buffered before frames are applied mid-read, as long as at least
/// one frame is complete or the pending header is bogus.
const MAX_BUFFERED_INPUT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// The socket would block.
    Drained,
    /// The buffer limit was hit with more input pending.
    Full,
    /// The peer closed the connection.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    /// The peer acknowledged our restart; stop reading.
    HandOff,
}

impl EventHandler for SessionInner {
    fn on_readable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.handing_off.load(Ordering::Acquire) {
            // The rest of the input belongs to the successor.
            return Ok(());
        }
        let mut read = self.reader.lock();
        self.process_input(&mut read)
    }

    fn on_error(&self, err: Error) {
        if self.is_closed() {
            return;
        }
        let peer_restarting = matches!(*self.restart.lock(), RestartPhase::Peer { .. });
        let reason = match &err {
            Error::EventConn(_) | Error::Io(_) | Error::ConnectionClosed => {
                SessionCounters::incr(&self.counters.event_conn_error);
                if peer_restarting {
                    CloseReason::RestartFailed
                } else {
                    CloseReason::ConnectionLost
                }
            }
            _ => CloseReason::Protocol,
        };
        if peer_restarting {
            SessionCounters::incr(&self.counters.hot_restart_error);
        }
        if reason == CloseReason::Protocol {
            error!(session = self.id, error = %err, "protocol failure");
        } else {
            debug!(session = self.id, error = %err, "control connection failed");
        }
        self.shutdown(reason);
    }

    fn on_tick(&self, now: Instant) {
        let expired = matches!(
            *self.restart.lock(),
            RestartPhase::Peer { deadline, .. } if now >= deadline
        );
        if expired {
            SessionCounters::incr(&self.counters.hot_restart_error);
            warn!(session = self.id, "peer did not finish its restart in time");
            self.shutdown(CloseReason::RestartFailed);
            return;
        }
        self.maybe_emit_metrics(now);
    }
}

impl SessionInner {
    /// Read and apply everything available on the connection.
    pub(crate) fn process_input(&self, read: &mut ReadSide) -> Result<()> {
        loop {
            self.consumer.lock().begin_drain();
            let bound = self.recv_queue.tail();
            let outcome = read_available(read)?;

            while let Some(event) = parse_frame(&mut read.buf)? {
                if self.handle_event(event)? == Flow::HandOff {
                    self.consumer.lock().end_drain();
                    return Ok(());
                }
            }
            match outcome {
                ReadOutcome::Eof => {
                    return Err(Error::EventConn(
                        "peer closed the control connection".to_string(),
                    ));
                }
                // A frame may be cut in half; wait for the rest before
                // trusting the snapshot.
                ReadOutcome::Full => continue,
                ReadOutcome::Drained => self.drain_to(bound)?,
            }
            if !self.consumer.lock().end_drain() {
                return Ok(());
            }
        }
    }

    fn handle_event(&self, event: Event) -> Result<Flow> {
        match event {
            Event::Polling => {
                SessionCounters::incr(&self.counters.receive_sync_event);
            }
            Event::FallbackData {
                stream_id,
                watermark,
                data,
            } => {
                self.drain_to_watermark(watermark)?;
                SessionCounters::incr(&self.counters.fallback_read);
                SessionCounters::add(&self.counters.in_flow_bytes, data.len() as u64);
                self.deliver(stream_id, Chunk::Inline(data));
            }
            Event::StreamClose {
                stream_id,
                watermark,
            } => {
                self.drain_to_watermark(watermark)?;
                self.on_remote_close(stream_id)?;
            }
            Event::HotRestart(ev) => self.on_peer_restart(ev)?,
            Event::HotRestartAck(ev) => return self.on_restart_ack(ev),
            Event::HotRestartDone(ev) => self.on_peer_restart_done(ev)?,
            other @ (Event::ExchangeProtoVersion { .. }
            | Event::ShareMemoryByFilePath(_)
            | Event::AckShareMemory) => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} on an established session",
                    other.event_type()
                )));
            }
        }
        Ok(Flow::Continue)
    }

    /// Drain until the peer's `watermark` (low 32 bits of its send tail) is
    /// reached.
    fn drain_to_watermark(&self, watermark: u32) -> Result<()> {
        let head = self.consumer.lock().head();
        let ahead = watermark.wrapping_sub(head as u32) as i32;
        if ahead > 0 {
            self.drain_to(head + ahead as u64)?;
        }
        Ok(())
    }

    /// Deliver queue entries until the head reaches `limit`.
    fn drain_to(&self, limit: u64) -> Result<()> {
        let mut consumer = self.consumer.lock();
        while consumer.head() < limit {
            match consumer.try_dequeue()? {
                Some(element) => self.deliver_element(element)?,
                None => {
                    return Err(Error::Protocol(format!(
                        "receive queue ends at {} before watermark {limit}",
                        consumer.head()
                    )));
                }
            }
        }
        Ok(())
    }

    fn deliver_element(&self, element: QueueElement) -> Result<()> {
        let buf = self.buffers.claim(element.descriptor)?;
        SessionCounters::add(&self.counters.in_flow_bytes, buf.len() as u64);
        self.deliver(element.stream_id, Chunk::Shm { buf, pos: 0 });
        Ok(())
    }

    fn deliver(&self, stream_id: u32, chunk: Chunk) {
        let stream = {
            let mut table = self.streams.lock();
            if self.is_closed() {
                return;
            }
            match table.streams.get(&stream_id).cloned() {
                Some(stream) => stream,
                None if self.role.opens(stream_id) => {
                    debug!(session = self.id, stream = stream_id, "data for released stream dropped");
                    return;
                }
                None => self.insert_peer_stream(&mut table, stream_id),
            }
        };
        if !stream.push(chunk) {
            debug!(session = self.id, stream = stream_id, "data for closed stream dropped");
        }
    }

    fn on_remote_close(&self, stream_id: u32) -> Result<()> {
        let stream = self.streams.lock().streams.get(&stream_id).cloned();
        match stream {
            Some(stream) => {
                if stream.mark_remote_closed() {
                    self.release_stream(stream_id);
                }
            }
            None if self.role.opens(stream_id) => {
                warn!(session = self.id, stream = stream_id, "close for unknown stream");
            }
            None => {
                // The peer opened and closed the stream without writing;
                // answer so it can reuse the id.
                let watermark = self.producer.lock().tail() as u32;
                self.send_control(&Event::StreamClose {
                    stream_id,
                    watermark,
                })?;
            }
        }
        Ok(())
    }

    fn on_peer_restart(&self, ev: RestartEvent) -> Result<()> {
        {
            let mut phase = self.restart.lock();
            if *phase != RestartPhase::Idle {
                return Err(Error::Protocol(format!(
                    "peer restart {} while in {:?}",
                    ev.epoch, *phase
                )));
            }
            *phase = RestartPhase::Peer {
                epoch: ev.epoch,
                deadline: Instant::now() + self.config.hot_restart_timeout,
            };
        }
        self.transition(SessionState::Established, SessionState::Restarting);
        info!(session = self.id, epoch = ev.epoch, "peer is restarting");
        self.send_control(&Event::HotRestartAck(ev))
    }

    fn on_restart_ack(&self, ev: RestartEvent) -> Result<Flow> {
        {
            let mut phase = self.restart.lock();
            match &mut *phase {
                RestartPhase::Local { epoch, acked } if *epoch == ev.epoch => *acked = true,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected restart ack {} in {other:?}",
                        ev.epoch
                    )));
                }
            }
            self.handing_off.store(true, Ordering::Release);
            self.restart_cv.notify_all();
        }
        self.deregister();
        debug!(session = self.id, epoch = ev.epoch, "restart acknowledged");
        Ok(Flow::HandOff)
    }

    fn on_peer_restart_done(&self, ev: RestartEvent) -> Result<()> {
        {
            let mut phase = self.restart.lock();
            match *phase {
                RestartPhase::Peer { epoch, .. } if epoch == ev.epoch => {
                    *phase = RestartPhase::Idle;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected restart completion {} in {other:?}",
                        ev.epoch
                    )));
                }
            }
        }
        self.transition(SessionState::Restarting, SessionState::Established);
        SessionCounters::incr(&self.counters.hot_restart_success);
        info!(session = self.id, epoch = ev.epoch, "peer restart completed");
        Ok(())
    }
}

/// Read until the socket would block, the buffer limit is hit or EOF.
fn read_available(read: &mut ReadSide) -> Result<ReadOutcome> {
    loop {
        if read.buf.len() >= MAX_BUFFERED_INPUT
            && peek_frame_len(&read.buf)
                .is_none_or(|len| len <= read.buf.len() || len > MAX_FRAME_SIZE as usize)
        {
            return Ok(ReadOutcome::Full);
        }
        let start = read.buf.len();
        read.buf.resize(start + READ_CHUNK, 0);
        let result = read.conn.read(&mut read.buf[start..]);
        match result {
            Ok(0) => {
                read.buf.truncate(start);
                return Ok(ReadOutcome::Eof);
            }
            Ok(n) => read.buf.truncate(start + n),
            Err(e) => {
                read.buf.truncate(start);
                match e.kind() {
                    io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Drained),
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(Error::EventConn(format!("read failed: {e}"))),
                }
            }
        }
    }
}
