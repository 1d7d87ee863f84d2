//! Bounded SPSC descriptor queues in shared memory.
//!
//! One queue file holds both directions of a session:
//!
//! ```text
//! +-----------------------+ 0
//! | QueueFileHeader (64)  |
//! +-----------------------+ 64
//! | QueueHeader c->s (192)|
//! | QueueHeader s->c (192)|
//! +-----------------------+ 448
//! | slots c->s            |
//! | slots s->c            |
//! +-----------------------+
//! ```
//!
//! `tail` is written only by the producer and `head` only by the consumer.
//! Every slot records the sequence number it was written at; the consumer
//! checks it against `head` so a lost or overwritten slot is caught instead
//! of silently delivered.
//!
//! The consumer raises `consumer_working` while draining. The producer only
//! sends a `Polling` event when the flag is clear. Both sides use `SeqCst`
//! for the flag and the cursor it races with, so either the producer sees the
//! flag clear or the consumer sees the new tail on its final check.

use std::fmt;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::buffer::BufferDescriptor;
use crate::shm::ShmFile;
use crate::{Error, Result};

/// Queue file magic ("SHMQ").
pub const QUEUE_MAGIC: u32 = 0x5348_4D51;

/// Queue file layout version.
pub const QUEUE_VERSION: u32 = 1;

#[repr(C)]
struct QueueFileHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    ready: AtomicU32,
    _pad: [u8; 48],
}

#[repr(C)]
struct QueueHeader {
    head: AtomicU64,
    _pad1: [u8; 56],
    tail: AtomicU64,
    _pad2: [u8; 56],
    consumer_working: AtomicU32,
    _pad3: [u8; 60],
}

#[repr(C)]
struct Slot {
    seq: AtomicU64,
    stream_id: AtomicU32,
    segment_id: AtomicU32,
    offset: AtomicU32,
    length: AtomicU32,
}

const _: () = assert!(size_of::<QueueFileHeader>() == 64);
const _: () = assert!(size_of::<QueueHeader>() == 192);
const _: () = assert!(size_of::<Slot>() == 24);

const HEADERS_START: usize = size_of::<QueueFileHeader>();
const SLOTS_START: usize = HEADERS_START + 2 * size_of::<QueueHeader>();

/// Queue direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written by the client, read by the server
    ClientToServer = 0,
    /// Written by the server, read by the client
    ServerToClient = 1,
}

/// One dequeued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueElement {
    /// Sequence number the entry was written at
    pub seq: u64,
    /// Stream the buffer belongs to
    pub stream_id: u32,
    /// The buffer
    pub descriptor: BufferDescriptor,
}

/// The shared file holding both queues of a session.
#[derive(Clone)]
pub struct QueueFile {
    file: Arc<ShmFile>,
    capacity: u32,
}

// SAFETY: all state shared through the mapping is atomic, and the layout
// fields are immutable after initialization.
#[allow(unsafe_code)]
unsafe impl Send for QueueFile {}
#[allow(unsafe_code)]
unsafe impl Sync for QueueFile {}

impl fmt::Debug for QueueFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFile")
            .field("path", &self.file.path())
            .field("capacity", &self.capacity)
            .finish()
    }
}

const fn file_len(capacity: u32) -> usize {
    SLOTS_START + 2 * capacity as usize * size_of::<Slot>()
}

impl QueueFile {
    /// Create a queue file with `capacity` slots per direction.
    #[allow(unsafe_code)]
    pub fn create(path: &Path, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "queue capacity must be a power of two, got {capacity}"
            )));
        }

        let file = ShmFile::create(path, file_len(capacity), |base, _| {
            // SAFETY: the mapping is file_len(capacity) bytes, page aligned
            // and private to us until published. The file starts zeroed, so
            // cursors, flags and slots are already in their initial state.
            let header = unsafe { &mut *base.cast::<QueueFileHeader>() };
            header.magic = QUEUE_MAGIC;
            header.version = QUEUE_VERSION;
            header.capacity = capacity;
            header.ready.store(1, Ordering::Release);
            Ok(())
        })?;

        Ok(Self {
            file: Arc::new(file),
            capacity,
        })
    }

    /// Map a queue file created by the peer.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self> {
        let file = ShmFile::open(path, SLOTS_START)?;
        // SAFETY: at least SLOTS_START bytes are mapped.
        let header = unsafe { &*file.as_ptr().cast::<QueueFileHeader>() };
        if header.magic != QUEUE_MAGIC
            || header.version != QUEUE_VERSION
            || header.ready.load(Ordering::Acquire) != 1
        {
            return Err(Error::SharedMemory(format!(
                "{} is not a queue file",
                path.display()
            )));
        }
        let capacity = header.capacity;
        if capacity == 0 || !capacity.is_power_of_two() || file.len() < file_len(capacity) {
            return Err(Error::SharedMemory(format!(
                "{} has an invalid capacity of {capacity}",
                path.display()
            )));
        }

        Ok(Self {
            file: Arc::new(file),
            capacity,
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Slots per direction.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Keep the file when the last mapping is dropped.
    pub fn retain(&self) {
        self.file.retain();
    }

    /// Take over unlinking of an inherited file.
    pub fn adopt(&self) {
        self.file.adopt();
    }

    /// Whether this process unlinks the file.
    pub fn is_owner(&self) -> bool {
        self.file.is_owner()
    }

    /// View of one direction.
    #[allow(unsafe_code)]
    pub fn queue(&self, direction: Direction) -> Queue {
        let index = direction as usize;
        let base = self.file.as_ptr();
        // SAFETY: both offsets lie inside the file_len() bytes checked at
        // creation or open.
        let (header, slots) = unsafe {
            (
                base.add(HEADERS_START + index * size_of::<QueueHeader>())
                    .cast::<QueueHeader>()
                    .cast_const(),
                base.add(SLOTS_START + index * self.capacity as usize * size_of::<Slot>())
                    .cast::<Slot>()
                    .cast_const(),
            )
        };
        Queue {
            _file: Arc::clone(&self.file),
            header,
            slots,
            mask: u64::from(self.capacity) - 1,
            capacity: u64::from(self.capacity),
        }
    }

    /// Producer end of `direction`.
    pub fn producer(&self, direction: Direction) -> Producer {
        Producer {
            queue: self.queue(direction),
        }
    }

    /// Consumer end of `direction`.
    pub fn consumer(&self, direction: Direction) -> Consumer {
        Consumer {
            queue: self.queue(direction),
        }
    }
}

/// Read-only view of one queue direction.
pub struct Queue {
    _file: Arc<ShmFile>,
    header: *const QueueHeader,
    slots: *const Slot,
    mask: u64,
    capacity: u64,
}

// SAFETY: see QueueFile.
#[allow(unsafe_code)]
unsafe impl Send for Queue {}
#[allow(unsafe_code)]
unsafe impl Sync for Queue {}

impl Queue {
    #[allow(unsafe_code)]
    fn header(&self) -> &QueueHeader {
        // SAFETY: the pointer targets the mapping kept alive by _file.
        unsafe { &*self.header }
    }

    #[allow(unsafe_code)]
    fn slot(&self, seq: u64) -> &Slot {
        // SAFETY: masked index is below capacity; slots live in the mapping.
        unsafe { &*self.slots.add((seq & self.mask) as usize) }
    }

    /// Consumer cursor.
    pub fn head(&self) -> u64 {
        self.header().head.load(Ordering::Acquire)
    }

    /// Producer cursor.
    pub fn tail(&self) -> u64 {
        self.header().tail.load(Ordering::SeqCst)
    }

    /// Number of queued entries.
    pub fn len(&self) -> u64 {
        self.tail().saturating_sub(self.head())
    }

    /// Whether no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Slots in this direction.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the consumer is currently draining.
    pub fn consumer_working(&self) -> bool {
        self.header().consumer_working.load(Ordering::SeqCst) != 0
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Writing end of a queue. There is one per direction.
#[derive(Debug)]
pub struct Producer {
    queue: Queue,
}

impl Producer {
    /// Publish a descriptor. Returns `false` when the queue is full.
    pub fn try_enqueue(&mut self, stream_id: u32, descriptor: BufferDescriptor) -> bool {
        let header = self.queue.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.queue.capacity {
            return false;
        }

        let slot = self.queue.slot(tail);
        slot.stream_id.store(stream_id, Ordering::Relaxed);
        slot.segment_id
            .store(descriptor.segment_id, Ordering::Relaxed);
        slot.offset.store(descriptor.offset, Ordering::Relaxed);
        slot.length.store(descriptor.length, Ordering::Relaxed);
        slot.seq.store(tail, Ordering::Relaxed);
        header.tail.store(tail + 1, Ordering::SeqCst);
        true
    }

    /// Whether the consumer needs a `Polling` event to notice new entries.
    pub fn needs_notify(&self) -> bool {
        !self.queue.consumer_working()
    }

    /// Next sequence number to be written.
    pub fn tail(&self) -> u64 {
        self.queue.tail()
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

/// Reading end of a queue.
#[derive(Debug)]
pub struct Consumer {
    queue: Queue,
}

impl Consumer {
    /// Take the oldest entry, if any.
    ///
    /// A slot whose sequence does not match the cursor means the queue was
    /// corrupted or a publication was lost; that is a fatal protocol error.
    pub fn try_dequeue(&mut self) -> Result<Option<QueueElement>> {
        let header = self.queue.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::SeqCst);
        if head == tail {
            return Ok(None);
        }
        if tail.wrapping_sub(head) > self.queue.capacity {
            return Err(Error::Protocol(format!(
                "queue cursors out of range: head {head}, tail {tail}"
            )));
        }

        let slot = self.queue.slot(head);
        let seq = slot.seq.load(Ordering::Relaxed);
        if seq != head {
            return Err(Error::Protocol(format!(
                "queue sequence gap: expected {head}, found {seq}"
            )));
        }
        let element = QueueElement {
            seq,
            stream_id: slot.stream_id.load(Ordering::Relaxed),
            descriptor: BufferDescriptor {
                segment_id: slot.segment_id.load(Ordering::Relaxed),
                offset: slot.offset.load(Ordering::Relaxed),
                length: slot.length.load(Ordering::Relaxed),
            },
        };
        header.head.store(head + 1, Ordering::Release);
        Ok(Some(element))
    }

    /// Mark the start of a drain.
    pub fn begin_drain(&self) {
        self.queue
            .header()
            .consumer_working
            .store(1, Ordering::SeqCst);
    }

    /// Mark the end of a drain. Returns `true` if entries arrived after the
    /// last dequeue, in which case the caller must drain again.
    pub fn end_drain(&self) -> bool {
        self.queue
            .header()
            .consumer_working
            .store(0, Ordering::SeqCst);
        !self.queue.is_empty()
    }

    /// Consumer cursor.
    pub fn head(&self) -> u64 {
        self.queue.head()
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}
