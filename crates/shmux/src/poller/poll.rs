//! Portable `poll(2)` backend with emulated edge semantics.
//!
//! A descriptor is disarmed as soon as it is reported and stays silent until
//! [`Poller::rearm`]. Registration changes made while another thread is
//! blocked in `wait` are picked up through an internal socket-pair waker.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Poller, Readiness, Token, event_conn_error, timeout_millis};
use crate::Result;

#[derive(Debug, Clone, Copy)]
struct Entry {
    fd: RawFd,
    token: Token,
    armed: bool,
}

/// `poll(2)` based poller.
#[derive(Debug)]
pub struct PollPoller {
    entries: Mutex<Vec<Entry>>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl PollPoller {
    /// Create a poller.
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            entries: Mutex::new(Vec::new()),
            wake_rx,
            wake_tx,
        })
    }

    fn wake(&self) {
        // A full socket already guarantees a pending wakeup.
        let _ = (&self.wake_tx).write(&[1]);
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.wake_rx).read(&mut buf), Ok(n) if n > 0) {}
    }
}

impl Poller for PollPoller {
    fn add(&self, fd: RawFd, token: Token) -> Result<()> {
        if fd < 0 {
            return Err(event_conn_error(
                "poll add",
                fd,
                &io::Error::from_raw_os_error(libc::EBADF),
            ));
        }
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.iter_mut().find(|e| e.fd == fd) {
                entry.token = token;
                entry.armed = true;
            } else {
                entries.push(Entry {
                    fd,
                    token,
                    armed: true,
                });
            }
        }
        self.wake();
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| e.fd != fd);
            before != entries.len()
        };
        if !removed {
            return Err(event_conn_error(
                "poll remove",
                fd,
                &io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }
        self.wake();
        Ok(())
    }

    #[allow(unsafe_code)]
    fn wait(&self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()> {
        events.clear();

        let watched: Vec<Entry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.armed)
            .copied()
            .collect();
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(watched.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(watched.iter().map(|e| libc::pollfd {
            fd: e.fd,
            events: libc::POLLIN,
            revents: 0,
        }));

        // SAFETY: fds is a valid array of fds.len() pollfd entries.
        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(event_conn_error("poll", -1, &err));
        }

        if fds[0].revents != 0 {
            self.drain_waker();
        }

        let mut entries = self.entries.lock();
        for (pfd, watched) in fds[1..].iter().zip(&watched) {
            if pfd.revents == 0 {
                continue;
            }
            // Skip descriptors removed or re-registered during the wait.
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.fd == watched.fd && e.token == watched.token && e.armed)
            else {
                continue;
            };
            entry.armed = false;
            events.push(Readiness {
                token: entry.token,
                readable: pfd.revents & libc::POLLIN != 0,
                hangup: pfd.revents & libc::POLLHUP != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }

    fn rearm(&self, fd: RawFd, token: Token) -> Result<()> {
        let found = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .find(|e| e.fd == fd)
                .map(|entry| {
                    entry.token = token;
                    entry.armed = true;
                })
                .is_some()
        };
        if found {
            self.wake();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
