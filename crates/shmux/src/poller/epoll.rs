//! Edge-triggered epoll backend.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Poller, Readiness, Token, event_conn_error, timeout_millis};
use crate::Result;

const MAX_EVENTS: usize = 64;

const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32;

/// Epoll instance watching for readability with `EPOLLET`.
#[derive(Debug)]
pub struct EpollPoller {
    epfd: OwnedFd,
}

impl EpollPoller {
    /// Create a new epoll instance.
    #[allow(unsafe_code)]
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall; the returned fd is checked before use.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(event_conn_error("epoll_create1", fd, &io::Error::last_os_error()));
        }
        // SAFETY: fd is a fresh descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    #[allow(unsafe_code)]
    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: INTEREST,
            u64: token,
        };
        // SAFETY: event is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &raw mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    fn add(&self, fd: RawFd, token: Token) -> Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, token) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => self
                .ctl(libc::EPOLL_CTL_MOD, fd, token)
                .map_err(|e| event_conn_error("epoll mod", fd, &e)),
            Err(e) => Err(event_conn_error("epoll add", fd, &e)),
        }
    }

    #[allow(unsafe_code)]
    fn remove(&self, fd: RawFd) -> Result<()> {
        // SAFETY: a null event pointer is allowed for EPOLL_CTL_DEL.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(event_conn_error("epoll remove", fd, &io::Error::last_os_error()));
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn wait(&self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()> {
        events.clear();
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        // SAFETY: raw has room for MAX_EVENTS entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                raw.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(event_conn_error("epoll wait", self.epfd.as_raw_fd(), &err));
        }

        for ev in &raw[..n as usize] {
            let bits = ev.events;
            let token = ev.u64;
            events.push(Readiness {
                token,
                readable: bits & (libc::EPOLLIN as u32) != 0,
                hangup: bits & ((libc::EPOLLRDHUP | libc::EPOLLHUP) as u32) != 0,
                error: bits & (libc::EPOLLERR as u32) != 0,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
