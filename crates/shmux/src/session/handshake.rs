//! Connection handshake.
//!
//! Runs in blocking mode with `handshake_timeout` on every read and write:
//!
//! 1. client and server exchange `ExchangeProtoVersion`; both settle on the
//!    lower version,
//! 2. the client creates segment 0 and the queue file and announces them
//!    with `ShareMemoryByFilePath`,
//! 3. the server maps both and answers `AckShareMemory`.
//!
//! The connection is switched to non-blocking mode on success.

use std::io;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use rand::{RngExt, rng};
use tracing::debug;

use crate::buffer::BufferManager;
use crate::config::SessionConfig;
use crate::protocol::{
    Event, HEADER_SIZE, Header, PROTOCOL_VERSION, ShareMemoryPaths, check_event_valid,
};
use crate::queue::QueueFile;
use crate::transport::Transport;
use crate::{Error, Result};

type Handshake = (u8, BufferManager, QueueFile);

pub(super) fn client(conn: &mut dyn Transport, config: &SessionConfig) -> Result<Handshake> {
    begin(conn, config)?;
    write_event(
        conn,
        &Event::ExchangeProtoVersion {
            version: PROTOCOL_VERSION,
        },
        PROTOCOL_VERSION,
    )?;
    let version = match read_event(conn)? {
        Event::ExchangeProtoVersion { version } => PROTOCOL_VERSION.min(version),
        other => return Err(unexpected("ExchangeProtoVersion", &other)),
    };
    debug!(version, "protocol version negotiated");

    let prefix = session_prefix(config);
    let buffers = BufferManager::create(&prefix, config.segment_layout()?)?;
    let queues = QueueFile::create(&queue_path(&prefix), config.queue_capacity)?;
    let paths = ShareMemoryPaths::new(queues.path(), &prefix);
    write_event(conn, &Event::ShareMemoryByFilePath(paths), version)?;
    match read_event(conn)? {
        Event::AckShareMemory => {}
        other => return Err(unexpected("AckShareMemory", &other)),
    }

    finish(conn)?;
    Ok((version, buffers, queues))
}

pub(super) fn server(conn: &mut dyn Transport, config: &SessionConfig) -> Result<Handshake> {
    begin(conn, config)?;
    let offered = match read_event(conn)? {
        Event::ExchangeProtoVersion { version } => version,
        other => return Err(unexpected("ExchangeProtoVersion", &other)),
    };
    write_event(
        conn,
        &Event::ExchangeProtoVersion {
            version: PROTOCOL_VERSION,
        },
        PROTOCOL_VERSION,
    )?;
    let version = PROTOCOL_VERSION.min(offered);
    debug!(version, "protocol version negotiated");

    let paths = match read_event(conn)? {
        Event::ShareMemoryByFilePath(paths) => paths,
        other => return Err(unexpected("ShareMemoryByFilePath", &other)),
    };
    let queues = QueueFile::open(paths.queue_path())?;
    let buffers = BufferManager::attach(paths.segment_prefix())?;
    write_event(conn, &Event::AckShareMemory, version)?;

    finish(conn)?;
    Ok((version, buffers, queues))
}

/// Queue file path for a session prefix.
fn queue_path(prefix: &Path) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push("_queue");
    PathBuf::from(name)
}

fn session_prefix(config: &SessionConfig) -> PathBuf {
    let suffix = hex::encode(rng().random::<u64>().to_be_bytes());
    config.shm_dir.join(format!(
        "{}_{}_{suffix}",
        config.path_prefix,
        std::process::id()
    ))
}

fn begin(conn: &dyn Transport, config: &SessionConfig) -> Result<()> {
    conn.set_nonblocking_mode(false)?;
    conn.set_read_timeout_opt(Some(config.handshake_timeout))?;
    conn.set_write_timeout_opt(Some(config.handshake_timeout))?;
    Ok(())
}

fn finish(conn: &dyn Transport) -> Result<()> {
    conn.set_read_timeout_opt(None)?;
    conn.set_write_timeout_opt(None)?;
    conn.set_nonblocking_mode(true)?;
    Ok(())
}

fn unexpected(expected: &str, got: &Event) -> Error {
    Error::Protocol(format!(
        "expected {expected} during handshake, got {:?}",
        got.event_type()
    ))
}

fn handshake_io(e: &io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::UnexpectedEof => {
            Error::EventConn("peer closed the connection during handshake".to_string())
        }
        _ => Error::EventConn(format!("handshake failed: {e}")),
    }
}

fn write_event(conn: &mut dyn Transport, event: &Event, version: u8) -> Result<()> {
    let frame = event.encode(version)?;
    conn.write_all(&frame).map_err(|e| handshake_io(&e))
}

/// Read one frame in blocking mode.
pub(crate) fn read_event(conn: &mut dyn Transport) -> Result<Event> {
    let mut frame = BytesMut::zeroed(HEADER_SIZE);
    conn.read_exact(&mut frame).map_err(|e| handshake_io(&e))?;
    let header = Header::decode(&frame)?;
    let kind = check_event_valid(&header)?;
    frame.resize(header.length as usize, 0);
    conn.read_exact(&mut frame[HEADER_SIZE..])
        .map_err(|e| handshake_io(&e))?;
    Event::decode(&header, kind, frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_handshake_maps_same_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(dir.path()).with_segment_size(1024 * 1024);
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let server_config = config.clone();
        let server = thread::spawn(move || server(&mut b, &server_config).unwrap());
        let (version, buffers, queues) = client(&mut a, &config).unwrap();
        let (server_version, server_buffers, server_queues) = server.join().unwrap();

        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(server_version, PROTOCOL_VERSION);
        assert_eq!(buffers.prefix(), server_buffers.prefix());
        assert_eq!(queues.path(), server_queues.path());
        assert!(queues.is_owner());
        assert!(!server_queues.is_owner());
    }

    #[test]
    fn test_non_utf8_shm_dir_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let shm_dir = dir.path().join(OsStr::from_bytes(b"shm\xff"));
        std::fs::create_dir(&shm_dir).unwrap();
        let config = SessionConfig::new(&shm_dir).with_segment_size(1024 * 1024);
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let server_config = config.clone();
        let server = thread::spawn(move || server(&mut b, &server_config).unwrap());
        let (_, buffers, queues) = client(&mut a, &config).unwrap();
        let (_, server_buffers, server_queues) = server.join().unwrap();

        assert_eq!(server_buffers.prefix(), buffers.prefix());
        assert_eq!(server_queues.path(), queues.path());
        assert!(queues.path().starts_with(&shm_dir));
    }

    #[test]
    fn test_older_peer_lowers_version() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(dir.path()).with_segment_size(1024 * 1024);
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let peer = thread::spawn(move || {
            let offer = read_event(&mut b).unwrap();
            assert_eq!(
                offer,
                Event::ExchangeProtoVersion {
                    version: PROTOCOL_VERSION
                }
            );
            write_event(&mut b, &Event::ExchangeProtoVersion { version: 1 }, 1).unwrap();
            let Event::ShareMemoryByFilePath(paths) = read_event(&mut b).unwrap() else {
                panic!("expected share memory paths");
            };
            assert!(paths.queue_path().as_os_str().as_bytes().ends_with(b"_queue"));
            write_event(&mut b, &Event::AckShareMemory, 1).unwrap();
        });

        let (version, _buffers, _queues) = client(&mut a, &config).unwrap();
        peer.join().unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(dir.path())
            .with_handshake_timeout(Duration::from_millis(50));
        let (mut a, _b) = UnixStream::pair().unwrap();
        assert!(matches!(client(&mut a, &config), Err(Error::Timeout)));
    }

    #[test]
    fn test_wrong_first_message_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(dir.path());
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_event(&mut a, &Event::Polling, PROTOCOL_VERSION).unwrap();
        assert!(matches!(server(&mut b, &config), Err(Error::Protocol(_))));
    }
}
