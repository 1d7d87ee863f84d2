//! Error types for shared-memory sessions and streams.
//!
//! Allocation and queue-full failures are recoverable: the session routes the
//! affected bytes through the control connection instead. Protocol and
//! control-connection failures close the session that observed them and are
//! reported by the next operation on any of its streams.

use std::io;
use thiserror::Error;

/// Result type for shmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a session.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a mapping or on the control connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No slab of the required class is free and no segment can be added.
    #[error("share memory allocation failed for {requested} bytes")]
    AllocShm {
        /// Requested allocation size in bytes
        requested: usize,
    },

    /// The send queue has no free slot.
    #[error("queue is full")]
    QueueFull,

    /// Frame header carries an unknown magic number or protocol version.
    #[error("invalid magic or version")]
    InvalidMagicOrVersion,

    /// Frame header carries an unknown message type or an impossible length.
    #[error("invalid protocol header")]
    InvalidProtocolHeader,

    /// Well-formed frame that violates the session protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Control connection failed, or the poller rejected it.
    #[error("event connection error: {0}")]
    EventConn(String),

    /// A stream deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Hot-restart handoff failed; reconnect to continue.
    #[error("hot restart failed: {0}")]
    HotRestart(String),

    /// The owning session is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream was closed locally.
    #[error("stream closed")]
    StreamClosed,

    /// Shared memory mapping or layout error.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller can retry or route around this failure without
    /// tearing down the session.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AllocShm { .. } | Self::QueueFull | Self::Timeout | Self::HotRestart(_)
        )
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Timeout => Self::new(io::ErrorKind::TimedOut, err),
            Error::ConnectionClosed | Error::EventConn(_) => {
                Self::new(io::ErrorKind::ConnectionAborted, err)
            }
            Error::StreamClosed => Self::new(io::ErrorKind::BrokenPipe, err),
            Error::InvalidMagicOrVersion | Error::InvalidProtocolHeader | Error::Protocol(_) => {
                Self::new(io::ErrorKind::InvalidData, err)
            }
            Error::Config(_) => Self::new(io::ErrorKind::InvalidInput, err),
            other => Self::other(other),
        }
    }
}
