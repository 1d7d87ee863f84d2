//! Integration tests for sessions and streams.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{
    Pair, connect, fake_server, pair, pair_with, pattern, read_len, read_to_end, test_config,
    tiny_config, wait_for,
};
use pretty_assertions::assert_eq;
use shmux::protocol::Event;
use shmux::{
    Error, Monitor, PerformanceMetrics, PollerKind, Session, SessionState, ShareMemoryMetrics,
    StabilityMetrics, TracingMonitor,
};

#[test]
fn test_round_trip_through_shared_memory() {
    let pair = pair();
    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.state(), SessionState::Established);

    let payload = pattern(100 * 1024, 1);
    let stream = pair.client.open_stream().unwrap();
    assert_eq!(stream.id(), 1);
    assert_eq!(stream.write(&payload).unwrap(), payload.len());

    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(accepted.id(), 1);
    assert_eq!(read_len(&accepted, payload.len()), payload);

    accepted.write(b"pong").unwrap();
    assert_eq!(read_len(&stream, 4), b"pong");

    let client = pair.client.metrics();
    let server = pair.server.metrics();
    assert_eq!(client.performance.out_flow_bytes, payload.len() as u64);
    assert_eq!(server.performance.in_flow_bytes, payload.len() as u64);
    assert_eq!(client.stability.fallback_write_count, 0);
    assert_eq!(server.stability.fallback_read_count, 0);
    assert_eq!(client.stability.active_stream_count, 1);
    assert!(client.share_memory.capacity_bytes > 0);
}

#[test]
fn test_server_opens_even_streams() {
    let pair = pair();
    let stream = pair.server.open_stream().unwrap();
    assert_eq!(stream.id(), 2);
    stream.write(b"from server").unwrap();

    let accepted = pair.client.accept_stream(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(accepted.id(), 2);
    assert_eq!(read_len(&accepted, 11), b"from server");
}

#[test]
fn test_fallback_when_share_memory_exhausted() {
    let pair = pair_with(tiny_config, PollerKind::Auto);
    let chunk = pair.client.buffer_manager().max_alloc_size();
    assert_eq!(chunk, 4096);

    // Far more than the segment holds while nobody reads.
    let payload = pattern(40 * chunk, 7);
    let stream = pair.client.open_stream().unwrap();
    assert_eq!(stream.write(&payload).unwrap(), payload.len());

    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(read_len(&accepted, payload.len()), payload);

    let client = pair.client.metrics().stability;
    let server = pair.server.metrics().stability;
    assert!(client.alloc_shm_error_count > 0);
    assert!(client.fallback_write_count > 0);
    assert_eq!(server.fallback_read_count, client.fallback_write_count);

    // Every slab went back once the reader consumed it.
    assert_eq!(pair.server.metrics().share_memory.in_use_bytes, 0);
}

#[test]
fn test_small_queue_keeps_per_stream_order() {
    fn two_slot_queue(dir: &std::path::Path) -> shmux::SessionConfig {
        test_config(dir).with_queue_capacity(2)
    }
    let pair = pair_with(two_slot_queue, PollerKind::Auto);

    let first = pattern(512 * 1024, 3);
    let second = pattern(512 * 1024, 9);
    let a = pair.client.open_stream().unwrap();
    let b = pair.client.open_stream().unwrap();

    thread::scope(|s| {
        s.spawn(|| assert_eq!(a.write(&first).unwrap(), first.len()));
        s.spawn(|| assert_eq!(b.write(&second).unwrap(), second.len()));

        for _ in 0..2 {
            let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
            let expected = if accepted.id() == a.id() { &first } else { &second };
            assert_eq!(&read_len(&accepted, expected.len()), expected);
        }
    });
}

#[test]
fn test_concurrent_echo_streams() {
    let pair = pair();
    const STREAMS: usize = 8;
    const LEN: usize = 200 * 1024;

    thread::scope(|s| {
        let server = &pair.server;
        s.spawn(move || {
            thread::scope(|inner| {
                for _ in 0..STREAMS {
                    let stream = server.accept_stream(Some(Duration::from_secs(5))).unwrap();
                    inner.spawn(move || {
                        let data = read_len(&stream, LEN);
                        stream.write(&data).unwrap();
                        // Keep the stream open until the client is done.
                        let _ = read_to_end(&stream);
                    });
                }
            });
        });

        let mut workers = Vec::new();
        for i in 0..STREAMS {
            let client = &pair.client;
            workers.push(s.spawn(move || {
                let stream = client.open_stream().unwrap();
                let payload = pattern(LEN, i as u8);
                stream.write(&payload).unwrap();
                assert_eq!(read_len(&stream, LEN), payload);
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    });
}

#[test]
fn test_read_deadline_expires() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

    let start = Instant::now();
    let mut buf = [0u8; 8];
    assert!(matches!(stream.read(&mut buf), Err(Error::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_past_deadline_keeps_buffered_data() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    stream.write(b"hi").unwrap();

    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    wait_for("data to arrive", || accepted.buffered_len() == 2);

    accepted.set_read_deadline(Some(Instant::now()));
    let mut buf = [0u8; 8];
    assert!(matches!(accepted.read(&mut buf), Err(Error::Timeout)));

    accepted.set_read_deadline(None);
    assert_eq!(accepted.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"hi");
}

#[test]
fn test_rearming_deadline_wakes_reader() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            stream.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        stream.set_deadline(Some(Instant::now()));
        assert!(matches!(reader.join().unwrap(), Err(Error::Timeout)));
    });
}

#[test]
fn test_write_deadline_in_the_past() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    stream.set_write_deadline(Some(Instant::now()));
    assert!(matches!(stream.write(b"late"), Err(Error::Timeout)));

    stream.set_write_deadline(None);
    assert_eq!(stream.write(b"ok").unwrap(), 2);
}

#[test]
fn test_accept_times_out() {
    let pair = pair();
    assert!(matches!(
        pair.server.accept_stream(Some(Duration::from_millis(30))),
        Err(Error::Timeout)
    ));
}

#[test]
fn test_close_handshake_releases_id() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    assert_eq!(stream.id(), 1);
    stream.write(b"bye").unwrap();
    stream.close().unwrap();
    assert!(matches!(stream.write(b"more"), Err(Error::StreamClosed)));

    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(read_to_end(&accepted), b"bye");
    drop(accepted);

    wait_for("client to release the id", || {
        pair.client.metrics().stability.active_stream_count == 0
    });
    assert_eq!(pair.server.metrics().stability.active_stream_count, 0);
    assert_eq!(pair.client.open_stream().unwrap().id(), 1);
}

#[test]
fn test_unused_stream_close_is_answered() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    drop(stream);

    wait_for("peer to answer the close", || {
        pair.client.metrics().stability.active_stream_count == 0
    });
    assert_eq!(pair.client.open_stream().unwrap().id(), 1);
}

#[test]
fn test_peer_close_fails_streams() {
    let Pair {
        client,
        server,
        dispatcher: _dispatcher,
        dir: _dir,
    } = pair();
    let stream = client.open_stream().unwrap();
    stream.write(b"x").unwrap();
    let accepted = server.accept_stream(Some(Duration::from_secs(5))).unwrap();

    server.close();
    assert!(server.is_closed());
    assert!(matches!(accepted.write(b"y"), Err(Error::ConnectionClosed)));

    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
    let mut buf = [0u8; 4];
    assert!(matches!(stream.read(&mut buf), Err(Error::ConnectionClosed)));
    wait_for("client to close", || client.is_closed());

    assert!(matches!(client.open_stream(), Err(Error::ConnectionClosed)));
    assert!(matches!(
        client.accept_stream(None),
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(client.metrics().stability.event_conn_error_count, 1);
    assert_eq!(client.metrics().stability.active_stream_count, 0);
    wait_for("buffers to return", || {
        client.metrics().share_memory.in_use_bytes == 0
    });
}

#[test]
fn test_close_frees_unread_buffers() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    stream.write(&pattern(64 * 1024, 2)).unwrap();

    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    wait_for("data to arrive", || accepted.buffered_len() == 64 * 1024);
    assert!(pair.server.metrics().share_memory.in_use_bytes > 0);

    pair.server.close();
    assert_eq!(pair.server.metrics().share_memory.in_use_bytes, 0);
}

#[test]
fn test_unread_stream_keeps_its_slabs() {
    let pair = pair();
    let stream = pair.client.open_stream().unwrap();
    for seed in 0..4 {
        stream.write(&pattern(16 * 1024, seed)).unwrap();
    }

    // Nothing throttles the sender while the receiver does not read.
    let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    wait_for("data to arrive", || accepted.buffered_len() == 64 * 1024);
    assert_eq!(pair.server.metrics().share_memory.in_use_bytes, 64 * 1024);

    assert_eq!(read_len(&accepted, 32 * 1024).len(), 32 * 1024);
    assert_eq!(accepted.buffered_len(), 32 * 1024);
    assert_eq!(pair.server.metrics().share_memory.in_use_bytes, 32 * 1024);
}

#[test]
fn test_dead_peer_unread_sends_are_reclaimed() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = common::dispatcher(PollerKind::Auto);
    let (a, b) = UnixStream::pair().unwrap();
    let peer = thread::spawn(move || fake_server(b));
    let client = Session::client(a, test_config(dir.path()), &dispatcher.handle()).unwrap();
    let peer = peer.join().unwrap();
    let baseline = client.metrics().share_memory.in_use_bytes;

    // Published on the queue; the peer never takes it.
    let stream = client.open_stream().unwrap();
    stream.write(&pattern(4096, 3)).unwrap();
    assert_eq!(client.metrics().share_memory.in_use_bytes, baseline + 4096);

    drop(peer);
    wait_for("client to notice", || client.is_closed());
    wait_for("unsent buffers to return", || {
        client.metrics().share_memory.in_use_bytes == baseline
    });
    assert!(matches!(stream.write(b"x"), Err(Error::ConnectionClosed)));
}

#[test]
fn test_full_queue_falls_back_in_order() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = common::dispatcher(PollerKind::Auto);
    let (a, b) = UnixStream::pair().unwrap();
    let peer = thread::spawn(move || fake_server(b));
    let config = test_config(dir.path()).with_queue_capacity(4);
    let client = Session::client(a, config, &dispatcher.handle()).unwrap();
    let mut peer = peer.join().unwrap();

    let stream = client.open_stream().unwrap();
    for byte in [b"a", b"b", b"c", b"d", b"e"] {
        stream.write(byte).unwrap();
    }
    let stability = client.metrics().stability;
    assert_eq!(stability.queue_full_error_count, 1);
    assert_eq!(stability.fallback_write_count, 1);

    // Four wakeups for the queued entries, then the overflow inline.
    for _ in 0..4 {
        assert!(matches!(common::read_frame(&mut peer), Event::Polling));
    }
    match common::read_frame(&mut peer) {
        Event::FallbackData {
            stream_id,
            watermark,
            data,
        } => {
            assert_eq!(stream_id, stream.id());
            assert_eq!(watermark, 4);
            assert_eq!(&data[..], b"e");
        }
        other => panic!("expected fallback data, got {other:?}"),
    }
}

#[test]
fn test_abrupt_disconnect_returns_buffers() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = common::dispatcher(PollerKind::Auto);
    let (a, b) = UnixStream::pair().unwrap();
    let severed = b.try_clone().unwrap();
    let (client, server) = connect(
        a,
        b,
        test_config(dir.path()),
        test_config(dir.path()),
        &dispatcher,
    );
    let baseline = client.metrics().share_memory.in_use_bytes;
    assert_eq!(server.metrics().share_memory.in_use_bytes, baseline);

    let up = client.open_stream().unwrap();
    up.write(&pattern(64 * 1024, 4)).unwrap();
    let down = server.open_stream().unwrap();
    down.write(&pattern(48 * 1024, 5)).unwrap();
    assert!(client.metrics().share_memory.in_use_bytes > baseline);

    // Neither side reads before the connection dies under them.
    severed.shutdown(Shutdown::Both).unwrap();
    wait_for("both sides to close", || {
        client.is_closed() && server.is_closed()
    });

    // Teardown finishes on the dispatcher thread after the state flips.
    wait_for("buffers to return", || {
        client.metrics().share_memory.in_use_bytes == baseline
            && server.metrics().share_memory.in_use_bytes == baseline
    });
    let mut buf = [0u8; 8];
    assert!(matches!(up.read(&mut buf), Err(Error::ConnectionClosed)));
    assert!(matches!(down.write(b"x"), Err(Error::ConnectionClosed)));
}

#[derive(Default)]
struct RecordingMonitor {
    emits: Mutex<Vec<StabilityMetrics>>,
    flushed: AtomicBool,
}

impl Monitor for RecordingMonitor {
    fn on_emit(
        &self,
        _performance: &PerformanceMetrics,
        stability: &StabilityMetrics,
        _share_memory: &ShareMemoryMetrics,
    ) {
        self.emits.lock().unwrap().push(*stability);
    }

    fn flush(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_monitor_receives_snapshots() {
    fn frequent(dir: &std::path::Path) -> shmux::SessionConfig {
        test_config(dir).with_metrics_interval(Duration::from_millis(20))
    }
    let pair = pair_with(frequent, PollerKind::Auto);
    let monitor = Arc::new(RecordingMonitor::default());
    pair.client.set_monitor(monitor.clone());
    pair.server.set_monitor(Arc::new(TracingMonitor::new("server")));

    let stream = pair.client.open_stream().unwrap();
    wait_for("a snapshot", || {
        monitor
            .emits
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.active_stream_count == 1)
    });

    pair.client.close();
    assert!(monitor.flushed.load(Ordering::SeqCst));
    let last = *monitor.emits.lock().unwrap().last().unwrap();
    assert_eq!(last.active_stream_count, 0);
    drop(stream);
}

#[test]
fn test_tcp_transport() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = common::dispatcher(PollerKind::Auto);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (b, _) = listener.accept().unwrap();

    let (client, server) = common::connect(
        a,
        b,
        test_config(dir.path()),
        test_config(dir.path()),
        &dispatcher,
    );
    let payload = pattern(300 * 1024, 5);
    let stream = client.open_stream().unwrap();
    stream.write(&payload).unwrap();

    let accepted = server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(read_len(&accepted, payload.len()), payload);
}

#[test]
fn test_poll_backend_sessions() {
    let pair = pair_with(test_config, PollerKind::Poll);
    let payload = pattern(256 * 1024, 11);
    let stream = pair.client.open_stream().unwrap();

    thread::scope(|s| {
        s.spawn(|| stream.write(&payload).unwrap());
        let accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(read_len(&accepted, payload.len()), payload);
    });
    assert!(pair.server.metrics().performance.receive_sync_event_count > 0);
}

#[test]
fn test_io_traits() {
    use std::io::{Read, Write};

    let pair = pair();
    let mut stream = pair.client.open_stream().unwrap();
    stream.write_all(b"through std::io").unwrap();
    stream.flush().unwrap();

    let mut accepted = pair.server.accept_stream(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 15];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"through std::io");

    accepted.set_read_deadline(Some(Instant::now()));
    let err = accepted.read_exact(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}
