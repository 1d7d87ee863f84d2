//! Readiness notification for control connections.
//!
//! [`Poller`] is the backend seam: [`EpollPoller`] uses edge-triggered epoll
//! on Linux, [`PollPoller`] uses `poll(2)` anywhere and emulates edge
//! semantics by disarming a descriptor once it is reported until the owner
//! calls [`Poller::rearm`] after draining it. The [`Dispatcher`] drives one
//! poller from a dedicated thread and calls into registered handlers; it
//! never reads or writes a session socket itself.

mod dispatcher;
#[cfg(target_os = "linux")]
mod epoll;
mod poll;

pub use dispatcher::{Dispatcher, DispatcherHandle, EventHandler};
#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;
pub use poll::PollPoller;

use std::os::unix::io::RawFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifies a registration in readiness reports.
pub type Token = u64;

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Token given at registration
    pub token: Token,
    /// Data (or EOF) can be read
    pub readable: bool,
    /// Peer hung up
    pub hangup: bool,
    /// Error condition on the descriptor
    pub error: bool,
}

/// Readiness backend.
pub trait Poller: Send + Sync {
    /// Watch `fd` for readability. Adding an fd that is already watched
    /// replaces its token.
    fn add(&self, fd: RawFd, token: Token) -> Result<()>;

    /// Stop watching `fd`.
    fn remove(&self, fd: RawFd) -> Result<()>;

    /// Wait for readiness. `None` blocks until an event arrives.
    ///
    /// `events` is cleared first. Interrupted waits return with no events.
    fn wait(&self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()>;

    /// Re-enable reports for `fd` once its owner drained it.
    fn rearm(&self, _fd: RawFd, _token: Token) -> Result<()> {
        Ok(())
    }

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerKind {
    /// Epoll where available, poll otherwise
    #[default]
    Auto,
    /// Edge-triggered epoll (Linux only)
    Epoll,
    /// Portable poll(2)
    Poll,
}

/// Build the backend selected by `kind`.
pub fn create_poller(kind: PollerKind) -> Result<Box<dyn Poller>> {
    match kind {
        #[cfg(target_os = "linux")]
        PollerKind::Auto | PollerKind::Epoll => Ok(Box::new(EpollPoller::new()?)),
        #[cfg(not(target_os = "linux"))]
        PollerKind::Auto => Ok(Box::new(PollPoller::new()?)),
        #[cfg(not(target_os = "linux"))]
        PollerKind::Epoll => Err(Error::Config(
            "epoll is not available on this platform".to_string(),
        )),
        PollerKind::Poll => Ok(Box::new(PollPoller::new()?)),
    }
}

/// Convert a timeout to the millisecond argument of epoll_wait/poll,
/// rounding up so short waits do not spin.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

pub(crate) fn event_conn_error(op: &str, fd: RawFd, err: &std::io::Error) -> Error {
    Error::EventConn(format!("{op} fd {fd}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1500))), 2);
        assert_eq!(timeout_millis(Some(Duration::from_secs(2))), 2000);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn test_create_each_backend() {
        assert_eq!(create_poller(PollerKind::Poll).unwrap().name(), "poll");
        #[cfg(target_os = "linux")]
        assert_eq!(create_poller(PollerKind::Auto).unwrap().name(), "epoll");
    }

    #[test]
    fn test_kind_serde() {
        let kind: PollerKind = serde_json::from_str("\"poll\"").unwrap();
        assert_eq!(kind, PollerKind::Poll);
    }
}
