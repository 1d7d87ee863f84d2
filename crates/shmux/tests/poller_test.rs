//! Readiness contract shared by every poller backend.

#![allow(clippy::unwrap_used)]

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use pretty_assertions::assert_eq;
use shmux::PollerKind;
use shmux::poller::{Poller, Readiness, create_poller};

const QUIET: Duration = Duration::from_millis(50);
const LOUD: Duration = Duration::from_secs(2);

fn drain(conn: &mut UnixStream) {
    let mut buf = [0u8; 256];
    while matches!(conn.read(&mut buf), Ok(n) if n > 0) {}
}

fn wait(poller: &dyn Poller, timeout: Duration) -> Vec<Readiness> {
    let mut events = Vec::new();
    poller.wait(&mut events, Some(timeout)).unwrap();
    events
}

fn check_contract(kind: PollerKind) {
    let poller = create_poller(kind).unwrap();
    let (mut local, mut remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    let fd = local.as_raw_fd();

    poller.add(fd, 7).unwrap();
    assert!(wait(poller.as_ref(), QUIET).is_empty());

    remote.write_all(b"ping").unwrap();
    let events = wait(poller.as_ref(), LOUD);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token, 7);
    assert!(events[0].readable);

    // Reported once until drained and re-armed.
    assert!(wait(poller.as_ref(), QUIET).is_empty());

    drain(&mut local);
    poller.rearm(fd, 7).unwrap();
    remote.write_all(b"again").unwrap();
    let events = wait(poller.as_ref(), LOUD);
    assert_eq!(events.len(), 1);
    assert!(events[0].readable);

    drain(&mut local);
    poller.rearm(fd, 7).unwrap();
    poller.remove(fd).unwrap();
    remote.write_all(b"ignored").unwrap();
    assert!(wait(poller.as_ref(), QUIET).is_empty());

    poller.add(fd, 8).unwrap();
    drop(remote);
    let events = wait(poller.as_ref(), LOUD);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token, 8);
    assert!(events[0].readable || events[0].hangup);
}

#[test]
fn test_poll_backend_contract() {
    check_contract(PollerKind::Poll);
}

#[cfg(target_os = "linux")]
#[test]
fn test_epoll_backend_contract() {
    check_contract(PollerKind::Epoll);
}

#[test]
fn test_auto_backend_contract() {
    check_contract(PollerKind::Auto);
}

#[test]
fn test_remove_unknown_fd_fails() {
    for kind in [PollerKind::Auto, PollerKind::Poll] {
        let poller = create_poller(kind).unwrap();
        let (local, _remote) = UnixStream::pair().unwrap();
        assert!(poller.remove(local.as_raw_fd()).is_err());
        assert!(wait(poller.as_ref(), QUIET).is_empty());
    }
}
