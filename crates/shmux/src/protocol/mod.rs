//! Wire codec for the control connection.
//!
//! Every frame starts with an 8-byte big-endian header:
//!
//! ```text
//! length:u32 | magic:u16 | version:u8 | msg_type:u8
//! ```
//!
//! `length` counts the whole frame, header included. Stream-scoped events
//! (`FallbackData`, `StreamClose`) extend the header with two `u32` fields,
//! the stream id and the sender's send-queue watermark, giving the 16-byte
//! [`StreamEvent`] layout. Fallback payload bytes follow the stream event.
//!
//! Decoding is split in two steps: [`Header::decode`] only parses, and
//! [`check_event_valid`] must accept the header before any payload is
//! interpreted.

mod payload;

pub use payload::{RestartEvent, ShareMemoryPaths};

use std::io::Cursor;

use binrw::{BinRead, BinWrite};
use bytes::{Bytes, BytesMut};

use crate::{Error, Result};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Size of a stream-scoped event (header + stream id + watermark).
pub const STREAM_EVENT_SIZE: usize = 16;

/// Magic number carried by every frame.
pub const MAGIC_NUMBER: u16 = 0x1234;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 2;

/// Oldest protocol version accepted from a peer.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Upper bound for a single frame (16MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Largest fallback payload that fits in one frame.
pub const MAX_FALLBACK_PAYLOAD: usize = MAX_FRAME_SIZE as usize - STREAM_EVENT_SIZE;

/// Message types exchanged over the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    /// Client announces the queue file and segment path prefix
    ShareMemoryByFilePath = 0,
    /// Producer published descriptors on the shared queue
    Polling = 1,
    /// Stream closed by the sender
    StreamClose = 2,
    /// Payload bytes carried in-band
    FallbackData = 3,
    /// Protocol version negotiation
    ExchangeProtoVersion = 4,
    /// Server mapped the announced shared memory
    AckShareMemory = 5,
    /// Sender is about to hand its session to a successor
    HotRestart = 6,
    /// Receiver stopped allocating and acknowledges the restart
    HotRestartAck = 7,
    /// Successor took over the session
    HotRestartDone = 8,
}

impl TryFrom<u8> for EventType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::ShareMemoryByFilePath,
            1 => Self::Polling,
            2 => Self::StreamClose,
            3 => Self::FallbackData,
            4 => Self::ExchangeProtoVersion,
            5 => Self::AckShareMemory,
            6 => Self::HotRestart,
            7 => Self::HotRestartAck,
            8 => Self::HotRestartDone,
            _ => return Err(Error::InvalidProtocolHeader),
        })
    }
}

/// Fixed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct Header {
    /// Total frame length in bytes, header included
    pub length: u32,
    /// Magic number, [`MAGIC_NUMBER`] for valid frames
    pub magic: u16,
    /// Protocol version of the sender
    pub version: u8,
    /// Raw message type; validated by [`check_event_valid`]
    pub msg_type: u8,
}

impl Header {
    /// Build a header with the local magic number.
    pub const fn new(length: u32, version: u8, msg_type: EventType) -> Self {
        Self {
            length,
            magic: MAGIC_NUMBER,
            version,
            msg_type: msg_type as u8,
        }
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// No validation beyond the size is performed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidProtocolHeader);
        }
        Self::read(&mut Cursor::new(&bytes[..HEADER_SIZE]))
            .map_err(|_| Error::InvalidProtocolHeader)
    }

    /// Encode the header into its wire form.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        write_fixed(self)
    }
}

/// Encode a header for a frame of `length` total bytes.
pub fn encode_header(length: u32, version: u8, msg_type: EventType) -> Result<[u8; HEADER_SIZE]> {
    Header::new(length, version, msg_type).encode()
}

/// Write a fixed-size big-endian struct into an `N`-byte array.
fn write_fixed<T, const N: usize>(value: &T) -> Result<[u8; N]>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut out = [0u8; N];
    value
        .write_be(&mut Cursor::new(&mut out[..]))
        .map_err(|e| Error::Protocol(format!("failed to encode frame prefix: {e}")))?;
    Ok(out)
}

/// Validate a decoded header and resolve its message type.
///
/// Magic and version are checked first, so a frame that is wrong on both
/// counts reports [`Error::InvalidMagicOrVersion`].
pub fn check_event_valid(header: &Header) -> Result<EventType> {
    if header.magic != MAGIC_NUMBER
        || !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&header.version)
    {
        return Err(Error::InvalidMagicOrVersion);
    }
    let kind = EventType::try_from(header.msg_type)?;
    if (header.length as usize) < HEADER_SIZE || header.length > MAX_FRAME_SIZE {
        return Err(Error::InvalidProtocolHeader);
    }
    Ok(kind)
}

/// Stream-scoped event: `FallbackData` and `StreamClose` share this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct StreamEvent {
    /// Frame header
    pub header: Header,
    /// Stream id (`seqA` on the wire)
    pub stream_id: u32,
    /// Low 32 bits of the sender's send-queue tail (`seqB` on the wire)
    pub watermark: u32,
}

impl StreamEvent {
    /// Encode into the 16-byte wire form.
    pub fn encode(&self) -> Result<[u8; STREAM_EVENT_SIZE]> {
        write_fixed(self)
    }

    /// Parse the 16-byte wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STREAM_EVENT_SIZE {
            return Err(Error::InvalidProtocolHeader);
        }
        Self::read(&mut Cursor::new(&bytes[..STREAM_EVENT_SIZE]))
            .map_err(|_| Error::InvalidProtocolHeader)
    }
}

/// Encode a `FallbackData` event prefix. `length` covers the payload that
/// follows.
pub fn encode_fallback_data(
    length: u32,
    version: u8,
    seq_a: u32,
    seq_b: u32,
) -> Result<[u8; STREAM_EVENT_SIZE]> {
    StreamEvent {
        header: Header::new(length, version, EventType::FallbackData),
        stream_id: seq_a,
        watermark: seq_b,
    }
    .encode()
}

/// A validated control-connection message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Shared memory announcement from the client
    ShareMemoryByFilePath(ShareMemoryPaths),
    /// Descriptors are waiting on the shared queue
    Polling,
    /// The peer closed a stream
    StreamClose {
        /// Stream id
        stream_id: u32,
        /// Peer send-queue watermark
        watermark: u32,
    },
    /// In-band payload
    FallbackData {
        /// Stream id
        stream_id: u32,
        /// Peer send-queue watermark
        watermark: u32,
        /// Payload bytes
        data: Bytes,
    },
    /// Version offer; the header version is the offered version
    ExchangeProtoVersion {
        /// Offered version
        version: u8,
    },
    /// Shared memory mapped by the server
    AckShareMemory,
    /// Hot restart announced
    HotRestart(RestartEvent),
    /// Hot restart acknowledged
    HotRestartAck(RestartEvent),
    /// Hot restart completed by the successor
    HotRestartDone(RestartEvent),
}

impl Event {
    /// Message type of this event.
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::ShareMemoryByFilePath(_) => EventType::ShareMemoryByFilePath,
            Self::Polling => EventType::Polling,
            Self::StreamClose { .. } => EventType::StreamClose,
            Self::FallbackData { .. } => EventType::FallbackData,
            Self::ExchangeProtoVersion { .. } => EventType::ExchangeProtoVersion,
            Self::AckShareMemory => EventType::AckShareMemory,
            Self::HotRestart(_) => EventType::HotRestart,
            Self::HotRestartAck(_) => EventType::HotRestartAck,
            Self::HotRestartDone(_) => EventType::HotRestartDone,
        }
    }

    /// Encode a complete frame.
    ///
    /// `ExchangeProtoVersion` is always sent with its own version in the
    /// header; other events use `version`.
    pub fn encode(&self, version: u8) -> Result<Vec<u8>> {
        let kind = self.event_type();
        match self {
            Self::Polling | Self::AckShareMemory => {
                Ok(encode_header(HEADER_SIZE as u32, version, kind)?.to_vec())
            }
            Self::ExchangeProtoVersion { version } => {
                Ok(encode_header(HEADER_SIZE as u32, *version, kind)?.to_vec())
            }
            Self::StreamClose {
                stream_id,
                watermark,
            } => Ok(StreamEvent {
                header: Header::new(STREAM_EVENT_SIZE as u32, version, kind),
                stream_id: *stream_id,
                watermark: *watermark,
            }
            .encode()?
            .to_vec()),
            Self::FallbackData {
                stream_id,
                watermark,
                data,
            } => {
                if data.len() > MAX_FALLBACK_PAYLOAD {
                    return Err(Error::Protocol(format!(
                        "fallback payload of {} bytes exceeds frame limit",
                        data.len()
                    )));
                }
                let length = (STREAM_EVENT_SIZE + data.len()) as u32;
                let mut out = Vec::with_capacity(length as usize);
                out.extend_from_slice(&encode_fallback_data(
                    length, version, *stream_id, *watermark,
                )?);
                out.extend_from_slice(data);
                Ok(out)
            }
            Self::ShareMemoryByFilePath(paths) => with_payload(version, kind, paths),
            Self::HotRestart(ev) | Self::HotRestartAck(ev) | Self::HotRestartDone(ev) => {
                with_payload(version, kind, ev)
            }
        }
    }

    /// Interpret a validated frame. `frame` holds the complete frame,
    /// header included.
    pub fn decode(header: &Header, kind: EventType, frame: Bytes) -> Result<Self> {
        let expect_len = |len: usize| {
            if frame.len() == len {
                Ok(())
            } else {
                Err(Error::Protocol(format!(
                    "{kind:?} frame must be {len} bytes, got {}",
                    frame.len()
                )))
            }
        };

        match kind {
            EventType::Polling => {
                expect_len(HEADER_SIZE)?;
                Ok(Self::Polling)
            }
            EventType::AckShareMemory => {
                expect_len(HEADER_SIZE)?;
                Ok(Self::AckShareMemory)
            }
            EventType::ExchangeProtoVersion => {
                expect_len(HEADER_SIZE)?;
                Ok(Self::ExchangeProtoVersion {
                    version: header.version,
                })
            }
            EventType::StreamClose => {
                expect_len(STREAM_EVENT_SIZE)?;
                let ev = StreamEvent::decode(&frame)?;
                Ok(Self::StreamClose {
                    stream_id: ev.stream_id,
                    watermark: ev.watermark,
                })
            }
            EventType::FallbackData => {
                if frame.len() < STREAM_EVENT_SIZE {
                    return Err(Error::Protocol(format!(
                        "fallback frame of {} bytes is shorter than its event",
                        frame.len()
                    )));
                }
                let ev = StreamEvent::decode(&frame)?;
                Ok(Self::FallbackData {
                    stream_id: ev.stream_id,
                    watermark: ev.watermark,
                    data: frame.slice(STREAM_EVENT_SIZE..),
                })
            }
            EventType::ShareMemoryByFilePath => {
                let paths = read_payload(&frame[HEADER_SIZE..])?;
                Ok(Self::ShareMemoryByFilePath(paths))
            }
            EventType::HotRestart => Ok(Self::HotRestart(read_payload(&frame[HEADER_SIZE..])?)),
            EventType::HotRestartAck => {
                Ok(Self::HotRestartAck(read_payload(&frame[HEADER_SIZE..])?))
            }
            EventType::HotRestartDone => {
                Ok(Self::HotRestartDone(read_payload(&frame[HEADER_SIZE..])?))
            }
        }
    }
}

fn with_payload<T>(version: u8, kind: EventType, payload: &T) -> Result<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(vec![0u8; HEADER_SIZE]);
    cursor.set_position(HEADER_SIZE as u64);
    payload
        .write_be(&mut cursor)
        .map_err(|e| Error::Protocol(format!("failed to encode {kind:?}: {e}")))?;
    let mut out = cursor.into_inner();
    let length = u32::try_from(out.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| Error::Protocol(format!("{kind:?} frame exceeds size limit")))?;
    out[..HEADER_SIZE].copy_from_slice(&encode_header(length, version, kind)?);
    Ok(out)
}

fn read_payload<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(bytes);
    let value = T::read_be(&mut cursor).map_err(|e| Error::Protocol(e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(Error::Protocol("trailing bytes after payload".to_string()));
    }
    Ok(value)
}

/// Try to split one complete, validated frame off the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame has arrived. The header is
/// validated as soon as its 8 bytes are present, so garbage is rejected
/// without waiting for a bogus length to fill up.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Event>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = Header::decode(&buf[..HEADER_SIZE])?;
    let kind = check_event_valid(&header)?;
    let length = header.length as usize;
    if buf.len() < length {
        buf.reserve(length - buf.len());
        return Ok(None);
    }
    let frame = buf.split_to(length).freeze();
    Event::decode(&header, kind, frame).map(Some)
}

/// Peek at the total length of the frame at the front of `buf`, if its
/// header has arrived.
pub fn peek_frame_len(buf: &[u8]) -> Option<usize> {
    (buf.len() >= HEADER_SIZE).then(|| u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}
