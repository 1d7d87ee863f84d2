//! Control connection transports.
//!
//! A session needs an ordered, reliable byte stream it can switch between
//! blocking mode (handshake) and non-blocking mode (dispatcher-driven). Unix
//! domain sockets are preferred; TCP works as a portable fallback.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::poller::timeout_millis;
use crate::{Error, Result};

/// Kind of control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportKind {
    /// Unix domain stream socket
    Unix = 0,
    /// TCP stream
    Tcp = 1,
}

impl TryFrom<u8> for TransportKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Unix),
            1 => Ok(Self::Tcp),
            other => Err(Error::HotRestart(format!("unknown transport kind {other}"))),
        }
    }
}

/// A duplex byte stream usable as a control connection.
pub trait Transport: Read + Write + AsRawFd + Send + Sync + fmt::Debug {
    /// Transport kind, recorded in hot-restart handoffs.
    fn kind(&self) -> TransportKind;

    /// Duplicate the underlying descriptor.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;

    /// Shut down both directions.
    fn shutdown_both(&self) -> io::Result<()>;

    /// Switch non-blocking mode.
    fn set_nonblocking_mode(&self, nonblocking: bool) -> io::Result<()>;

    /// Set the blocking read timeout.
    fn set_read_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set the blocking write timeout.
    fn set_write_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for UnixStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_nonblocking_mode(&self, nonblocking: bool) -> io::Result<()> {
        self.set_nonblocking(nonblocking)
    }

    fn set_read_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn set_write_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_write_timeout(timeout)
    }
}

impl Transport for TcpStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_nonblocking_mode(&self, nonblocking: bool) -> io::Result<()> {
        self.set_nonblocking(nonblocking)
    }

    fn set_read_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn set_write_timeout_opt(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_write_timeout(timeout)
    }
}

/// Rebuild a transport from a descriptor received over a side channel.
pub fn transport_from_fd(kind: TransportKind, fd: OwnedFd) -> Box<dyn Transport> {
    match kind {
        TransportKind::Unix => Box::new(UnixStream::from(fd)),
        TransportKind::Tcp => Box::new(TcpStream::from(fd)),
    }
}

/// Block until `fd` is writable or `deadline` passes.
#[allow(unsafe_code)]
fn wait_writable(fd: RawFd, deadline: Instant) -> Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let n = unsafe { libc::poll(&raw mut pfd, 1, timeout_millis(Some(remaining))) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::EventConn(format!("poll for write: {err}")));
        }
        if n > 0 {
            return Ok(());
        }
    }
}

/// Write all of `buf` to a non-blocking transport before `deadline`.
///
/// A timeout after the first byte leaves a partial frame on the wire; the
/// caller must treat the connection as broken in that case.
pub fn write_all_until(conn: &mut dyn Transport, mut buf: &[u8], deadline: Instant) -> Result<()> {
    while !buf.is_empty() {
        match conn.write(buf) {
            Ok(0) => {
                return Err(Error::EventConn(
                    "control connection accepted no bytes".to_string(),
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(conn.as_raw_fd(), deadline)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::EventConn(format!("write failed: {e}"))),
        }
    }
    Ok(())
}
