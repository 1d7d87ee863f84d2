//! Shared-memory stream multiplexing between local processes.
//!
//! Two processes on one host connect over a Unix domain socket (or TCP) and
//! multiplex many byte streams over it. Payloads travel through shared
//! memory: the writer copies a chunk into a slab of a shared segment and
//! publishes its descriptor on a lock-free queue; the reader picks the
//! descriptor up and reads the bytes in place. The socket carries only small
//! control events, plus whole payloads when shared memory is exhausted.
//!
//! # Architecture
//!
//! - `protocol`: control frame codec
//! - `buffer`: size-classed slab allocator over shared segment files
//! - `queue`: single-producer single-consumer descriptor queues
//! - `poller`: edge-triggered readiness and the dispatcher thread
//! - `session`: connection state machine, handshake and data path
//! - `stream`: blocking stream handles with deadlines
//! - `restart`: handing a live session to a successor process
//! - `metrics`: counters and the [`Monitor`] capability
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::os::unix::net::UnixStream;
//! use shmux::{Dispatcher, DispatcherConfig, Session, SessionConfig};
//!
//! fn main() -> shmux::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//!     let (a, b) = UnixStream::pair()?;
//!
//!     let server = std::thread::spawn({
//!         let handle = dispatcher.handle();
//!         move || Session::server(b, SessionConfig::default(), &handle)
//!     });
//!     let client = Session::client(a, SessionConfig::default(), &dispatcher.handle())?;
//!     let server = server.join().expect("server thread")?;
//!
//!     let mut stream = client.open_stream()?;
//!     stream.write_all(b"hello")?;
//!
//!     let mut accepted = server.accept_stream(None)?;
//!     let mut buf = [0u8; 5];
//!     accepted.read_exact(&mut buf)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod restart;
pub mod session;
pub mod shm;
pub mod stream;
pub mod transport;

pub use buffer::{BufferDescriptor, BufferManager, ShmBuffer};
pub use config::{DispatcherConfig, SessionConfig, SizePercent};
pub use error::{Error, Result};
pub use metrics::{
    Monitor, PerformanceMetrics, SessionMetrics, ShareMemoryMetrics, StabilityMetrics,
    TracingMonitor,
};
pub use poller::{Dispatcher, DispatcherHandle, PollerKind};
pub use session::{Role, Session, SessionState};
pub use stream::Stream;
pub use transport::{Transport, TransportKind};
