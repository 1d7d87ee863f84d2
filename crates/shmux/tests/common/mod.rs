//! Shared helpers for session integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use shmux::protocol::{Event, HEADER_SIZE, Header, PROTOCOL_VERSION, check_event_valid};
use shmux::{
    Dispatcher, DispatcherConfig, PollerKind, Session, SessionConfig, SizePercent, Stream,
    Transport,
};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Small segments so tests do not reserve much shared memory.
pub fn test_config(dir: &Path) -> SessionConfig {
    SessionConfig::new(dir)
        .with_segment_size(2 * 1024 * 1024)
        .with_queue_capacity(256)
        .with_handshake_timeout(Duration::from_secs(5))
        .with_hot_restart_timeout(Duration::from_secs(5))
}

/// One segment holding a handful of 4 KiB slabs.
pub fn tiny_config(dir: &Path) -> SessionConfig {
    SessionConfig::new(dir)
        .with_segment_size(64 * 1024)
        .with_max_segments(1)
        .with_size_classes(vec![SizePercent::new(4096, 100)])
        .with_queue_capacity(64)
}

/// A connected client and server sharing one dispatcher.
///
/// Fields drop in order: sessions first, then the dispatcher, then the
/// shared memory directory.
pub struct Pair {
    pub client: Session,
    pub server: Session,
    pub dispatcher: Dispatcher,
    pub dir: TempDir,
}

pub fn dispatcher(kind: PollerKind) -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig::default()
            .with_poller(kind)
            .with_tick_interval(Duration::from_millis(10)),
    )
    .expect("dispatcher")
}

/// Run both handshakes over `a` and `b`.
pub fn connect<T>(
    a: T,
    b: T,
    client_config: SessionConfig,
    server_config: SessionConfig,
    dispatcher: &Dispatcher,
) -> (Session, Session)
where
    T: Transport + 'static,
{
    let handle = dispatcher.handle();
    let server = thread::spawn(move || Session::server(b, server_config, &handle));
    let client = Session::client(a, client_config, &dispatcher.handle()).expect("client session");
    let server = server
        .join()
        .expect("server thread")
        .expect("server session");
    (client, server)
}

pub fn pair_with(make_config: fn(&Path) -> SessionConfig, kind: PollerKind) -> Pair {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let dispatcher = dispatcher(kind);
    let (a, b) = UnixStream::pair().expect("socket pair");
    let (client, server) = connect(
        a,
        b,
        make_config(dir.path()),
        make_config(dir.path()),
        &dispatcher,
    );
    Pair {
        client,
        server,
        dispatcher,
        dir,
    }
}

pub fn pair() -> Pair {
    pair_with(test_config, PollerKind::Auto)
}

/// Read exactly `len` bytes, failing the test after five seconds.
pub fn read_len(stream: &Stream, len: usize) -> Vec<u8> {
    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
    let mut out = vec![0u8; len];
    let mut reader = stream;
    reader.read_exact(&mut out).expect("read_exact");
    stream.set_read_deadline(None);
    out
}

/// Read until the peer closes the stream.
pub fn read_to_end(stream: &Stream) -> Vec<u8> {
    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
    let mut out = Vec::new();
    let mut reader = stream;
    reader.read_to_end(&mut out).expect("read_to_end");
    out
}

/// Poll `cond` until it holds or five seconds pass.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Blocking frame read for a hand-written peer.
pub fn read_frame(conn: &mut UnixStream) -> Event {
    let mut frame = BytesMut::zeroed(HEADER_SIZE);
    conn.read_exact(&mut frame).expect("frame header");
    let header = Header::decode(&frame).expect("valid header");
    let kind = check_event_valid(&header).expect("known event");
    frame.resize(header.length as usize, 0);
    conn.read_exact(&mut frame[HEADER_SIZE..]).expect("frame body");
    Event::decode(&header, kind, frame.freeze()).expect("valid event")
}

pub fn write_frame(conn: &mut UnixStream, event: &Event) {
    conn.write_all(&event.encode(PROTOCOL_VERSION).expect("encode"))
        .expect("write frame");
}

/// Answer a client handshake without mapping anything. The returned socket
/// is the peer's end of the control connection.
pub fn fake_server(mut conn: UnixStream) -> UnixStream {
    let Event::ExchangeProtoVersion { .. } = read_frame(&mut conn) else {
        panic!("expected a version offer");
    };
    write_frame(
        &mut conn,
        &Event::ExchangeProtoVersion {
            version: PROTOCOL_VERSION,
        },
    );
    let Event::ShareMemoryByFilePath(_) = read_frame(&mut conn) else {
        panic!("expected share memory paths");
    };
    write_frame(&mut conn, &Event::AckShareMemory);
    conn
}
