//! The dispatcher thread.
//!
//! One thread waits on the poller and calls the handler registered for each
//! ready descriptor. Handlers are invoked without any dispatcher lock held, so
//! they may register or deregister (themselves included). A handler whose
//! `on_readable` fails is deregistered and then told why through `on_error`;
//! the loop carries on with the other registrations.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::{Poller, Readiness, Token, create_poller};
use crate::config::DispatcherConfig;
use crate::{Error, Result};

const WAKER_TOKEN: Token = u64::MAX;

/// Callbacks a dispatcher makes into a registered session.
pub trait EventHandler: Send + Sync {
    /// The descriptor became readable. The handler must read until it would
    /// block before returning, or data may go unnoticed.
    fn on_readable(&self) -> Result<()>;

    /// The registration was dropped because of `err`.
    fn on_error(&self, err: Error);

    /// Periodic timer callback.
    fn on_tick(&self, _now: Instant) {}
}

struct Registration {
    fd: RawFd,
    handler: Arc<dyn EventHandler>,
}

pub(crate) struct DispatcherShared {
    poller: Box<dyn Poller>,
    handlers: DashMap<Token, Registration>,
    next_token: AtomicU64,
    shutdown: AtomicBool,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
    tick_interval: Duration,
}

/// Owner of a dispatcher thread.
///
/// Dropping the dispatcher stops the thread; sessions still registered are
/// closed with an event connection error.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Option<JoinHandle<()>>,
}

/// Registration handle held by sessions.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<DispatcherShared>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("poller", &self.shared.poller.name())
            .field("registrations", &self.shared.handlers.len())
            .finish()
    }
}

impl Dispatcher {
    /// Start a dispatcher thread.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let poller = create_poller(config.poller)?;
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        poller.add(wake_rx.as_raw_fd(), WAKER_TOKEN)?;

        let shared = Arc::new(DispatcherShared {
            poller,
            handlers: DashMap::new(),
            next_token: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            tick_interval: config.tick_interval,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("shmux-dispatcher".to_string())
            .spawn(move || thread_shared.run())?;

        info!(poller = shared.poller.name(), "dispatcher started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Handle for registering sessions.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Backend in use.
    pub fn poller_name(&self) -> &'static str {
        self.shared.poller.name()
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        self.shared.handlers.len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl DispatcherHandle {
    /// Register `fd` with `handler`. Returns the token for
    /// [`DispatcherHandle::deregister`].
    pub fn register(&self, fd: RawFd, handler: Arc<dyn EventHandler>) -> Result<Token> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::EventConn("dispatcher is shut down".to_string()));
        }
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared
            .handlers
            .insert(token, Registration { fd, handler });
        if let Err(e) = self.shared.poller.add(fd, token) {
            self.shared.handlers.remove(&token);
            return Err(e);
        }
        debug!(token, fd, "registered");
        Ok(token)
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn deregister(&self, token: Token) -> bool {
        self.shared.deregister(token)
    }
}

impl DispatcherShared {
    fn wake(&self) {
        let _ = (&self.wake_tx).write(&[1]);
    }

    fn deregister(&self, token: Token) -> bool {
        let Some((_, registration)) = self.handlers.remove(&token) else {
            return false;
        };
        if let Err(e) = self.poller.remove(registration.fd) {
            debug!(token, error = %e, "poller remove failed");
        }
        debug!(token, fd = registration.fd, "deregistered");
        true
    }

    fn run(self: Arc<Self>) {
        let mut events = Vec::with_capacity(64);
        let mut next_tick = Instant::now() + self.tick_interval;

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(e) = self.poller.wait(&mut events, Some(timeout)) {
                warn!(error = %e, "poller wait failed");
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            for ready in &events {
                if ready.token == WAKER_TOKEN {
                    let mut buf = [0u8; 64];
                    while matches!((&self.wake_rx).read(&mut buf), Ok(n) if n > 0) {}
                    let _ = self.poller.rearm(self.wake_rx.as_raw_fd(), WAKER_TOKEN);
                    continue;
                }
                self.dispatch(*ready);
            }

            let now = Instant::now();
            if now >= next_tick {
                next_tick = now + self.tick_interval;
                let handlers: Vec<Arc<dyn EventHandler>> = self
                    .handlers
                    .iter()
                    .map(|r| Arc::clone(&r.handler))
                    .collect();
                for handler in handlers {
                    handler.on_tick(now);
                }
            }
        }

        let remaining: Vec<Token> = self.handlers.iter().map(|r| *r.key()).collect();
        for token in remaining {
            if let Some((_, registration)) = self.handlers.remove(&token) {
                let _ = self.poller.remove(registration.fd);
                registration
                    .handler
                    .on_error(Error::EventConn("dispatcher stopped".to_string()));
            }
        }
        info!("dispatcher stopped");
    }

    fn dispatch(&self, ready: Readiness) {
        let token = ready.token;
        let Some((fd, handler)) = self
            .handlers
            .get(&token)
            .map(|r| (r.fd, Arc::clone(&r.handler)))
        else {
            return;
        };

        // A hangup still leaves buffered input to read; the read then
        // reports EOF. An error alone has nothing left to drain.
        if ready.error && !ready.readable && !ready.hangup {
            debug!(token, "error condition on descriptor, deregistering");
            self.deregister(token);
            handler.on_error(Error::EventConn(format!("error condition on fd {fd}")));
            return;
        }

        match handler.on_readable() {
            Ok(()) => {
                if self.handlers.contains_key(&token)
                    && let Err(e) = self.poller.rearm(fd, token)
                {
                    warn!(token, error = %e, "rearm failed");
                }
            }
            Err(e) => {
                debug!(token, error = %e, "handler failed, deregistering");
                self.deregister(token);
                handler.on_error(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerKind;
    use parking_lot::Mutex;
    use std::sync::mpsc;

    struct Echo {
        stream: UnixStream,
        tx: Mutex<mpsc::Sender<String>>,
    }

    impl EventHandler for Echo {
        fn on_readable(&self) -> Result<()> {
            let mut buf = [0u8; 64];
            loop {
                match (&self.stream).read(&mut buf) {
                    Ok(0) => return Err(Error::EventConn("eof".into())),
                    Ok(n) => {
                        let _ = self
                            .tx
                            .lock()
                            .send(String::from_utf8_lossy(&buf[..n]).into_owned());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        fn on_error(&self, err: Error) {
            let _ = self.tx.lock().send(format!("error: {err}"));
        }
    }

    fn run_backend(kind: PollerKind) {
        let dispatcher = Dispatcher::new(
            DispatcherConfig::default()
                .with_poller(kind)
                .with_tick_interval(Duration::from_millis(10)),
        )
        .unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();
        let fd = server.as_raw_fd();
        let handler = Arc::new(Echo {
            stream: server,
            tx: Mutex::new(tx),
        });

        dispatcher.handle().register(fd, handler).unwrap();
        client.write_all(b"one").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "one");
        client.write_all(b"two").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "two");

        drop(client);
        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(msg.starts_with("error:"), "{msg}");
        assert_eq!(dispatcher.registrations(), 0);
    }

    #[test]
    fn test_dispatch_with_poll() {
        run_backend(PollerKind::Poll);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dispatch_with_epoll() {
        run_backend(PollerKind::Epoll);
    }

    #[test]
    fn test_drop_closes_registrations() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();
        let fd = server.as_raw_fd();
        dispatcher
            .handle()
            .register(
                fd,
                Arc::new(Echo {
                    stream: server,
                    tx: Mutex::new(tx),
                }),
            )
            .unwrap();

        drop(dispatcher);
        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg, "error: event connection error: dispatcher stopped");
    }

    #[test]
    fn test_error_readiness_fails_handler() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();
        let fd = server.as_raw_fd();
        let token = dispatcher
            .handle()
            .register(
                fd,
                Arc::new(Echo {
                    stream: server,
                    tx: Mutex::new(tx),
                }),
            )
            .unwrap();

        dispatcher.shared.dispatch(Readiness {
            token,
            readable: false,
            hangup: false,
            error: true,
        });
        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(msg.contains("error condition"), "{msg}");
        assert_eq!(dispatcher.registrations(), 0);
    }

    #[test]
    fn test_hangup_reads_to_eof() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();
        let fd = server.as_raw_fd();
        let handler = Arc::new(Echo {
            stream: server,
            tx: Mutex::new(tx),
        });
        let token = dispatcher.handle().register(fd, handler).unwrap();
        // Remove it from the poller so only the direct dispatch below runs.
        assert!(dispatcher.shared.poller.remove(fd).is_ok());

        client.write_all(b"last").unwrap();
        drop(client);
        dispatcher.shared.dispatch(Readiness {
            token,
            readable: false,
            hangup: true,
            error: true,
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "last");
        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(msg.starts_with("error:"), "{msg}");
    }
}
