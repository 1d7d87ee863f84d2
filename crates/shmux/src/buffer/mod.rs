//! Shared-memory buffer manager.
//!
//! A session's memory is a set of segment files `<prefix>_seg<id>`. Segment 0
//! is created by the client during the handshake; either side may add more
//! segments later, up to the ceiling recorded in segment 0. Ids come from an
//! atomic counter in segment 0's header, so both processes can grow the set
//! without coordinating over the control connection.
//!
//! Only [`BufferDescriptor`]s cross the process boundary. Each side maps
//! segments on its own and translates offsets to local addresses; descriptors
//! naming a segment this side has not seen yet are mapped lazily.

mod segment;

pub use segment::{ClassLayout, SegmentLayout};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::metrics::ShareMemoryMetrics;
use crate::{Error, Result};
use segment::Segment;

/// Location of one buffer inside the shared segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Segment id
    pub segment_id: u32,
    /// Byte offset of the slab inside the segment
    pub offset: u32,
    /// Number of valid bytes
    pub length: u32,
}

struct ManagerShared {
    prefix: PathBuf,
    layout: SegmentLayout,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
}

/// Allocator over the shared segments of one session.
///
/// Cloning is cheap; clones share the same mappings.
#[derive(Clone)]
pub struct BufferManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("prefix", &self.shared.prefix)
            .field("segments", &self.shared.segments.read().len())
            .finish()
    }
}

/// Path of segment `id` under `prefix`.
pub fn segment_path(prefix: &Path, id: u32) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_seg{id}"));
    PathBuf::from(name)
}

impl BufferManager {
    /// Create segment 0 under `prefix`.
    pub fn create(prefix: &Path, layout: SegmentLayout) -> Result<Self> {
        if layout.max_segments == 0 {
            return Err(Error::Config("max_segments must be at least 1".to_string()));
        }
        let seg0 = Segment::create(&segment_path(prefix, 0), 0, &layout)?;
        info!(
            prefix = %prefix.display(),
            segment_size = layout.segment_size,
            max_segments = layout.max_segments,
            "created share memory"
        );
        Ok(Self::with_segments(prefix, layout, [(0, Arc::new(seg0))]))
    }

    /// Map the segments the peer announced under `prefix`.
    ///
    /// Only segment 0 is required; other segments are mapped on first use.
    pub fn attach(prefix: &Path) -> Result<Self> {
        let seg0 = Segment::attach(&segment_path(prefix, 0), 0)?;
        let layout = seg0.layout();
        let manager = Self::with_segments(prefix, layout, [(0, Arc::new(seg0))]);
        manager.discover();
        debug!(prefix = %prefix.display(), "attached share memory");
        Ok(manager)
    }

    fn with_segments(
        prefix: &Path,
        layout: SegmentLayout,
        segments: impl IntoIterator<Item = (u32, Arc<Segment>)>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                prefix: prefix.to_path_buf(),
                layout,
                segments: RwLock::new(segments.into_iter().collect()),
            }),
        }
    }

    /// Segment path prefix.
    pub fn prefix(&self) -> &Path {
        &self.shared.prefix
    }

    /// Geometry used for new segments.
    pub fn layout(&self) -> &SegmentLayout {
        &self.shared.layout
    }

    /// Largest single allocation.
    pub fn max_alloc_size(&self) -> usize {
        self.shared.layout.max_slab_size() as usize
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// The request is rounded up to the smallest class that fits, larger
    /// classes are tried next, then segments added by the peer, then a new
    /// segment while under the ceiling. [`Error::AllocShm`] tells the caller
    /// to fall back to the control connection.
    pub fn allocate(&self, size: usize) -> Result<ShmBuffer> {
        let Ok(size32) = u32::try_from(size) else {
            return Err(Error::AllocShm { requested: size });
        };
        if size == 0 || size32 > self.shared.layout.max_slab_size() {
            return Err(Error::AllocShm { requested: size });
        }

        if let Some(buf) = self.try_allocate_mapped(size32) {
            return Ok(buf);
        }
        if self.discover() > 0
            && let Some(buf) = self.try_allocate_mapped(size32)
        {
            return Ok(buf);
        }
        while let Some(segment) = self.grow() {
            if let Some(buf) = Self::try_allocate_in(&segment, size32) {
                return Ok(buf);
            }
        }
        Err(Error::AllocShm { requested: size })
    }

    fn try_allocate_mapped(&self, size: u32) -> Option<ShmBuffer> {
        let segments: Vec<Arc<Segment>> = self.shared.segments.read().values().cloned().collect();
        segments
            .iter()
            .find_map(|segment| Self::try_allocate_in(segment, size))
    }

    fn try_allocate_in(segment: &Arc<Segment>, size: u32) -> Option<ShmBuffer> {
        (0..segment.class_count())
            .filter(|&class| segment.slab_size(class) >= size)
            .find_map(|class| {
                segment.try_alloc(class).map(|offset| ShmBuffer {
                    segment: Arc::clone(segment),
                    offset,
                    capacity: segment.slab_size(class),
                    len: size,
                    owned: true,
                })
            })
    }

    fn segment_zero(&self) -> Option<Arc<Segment>> {
        self.shared.segments.read().get(&0).cloned()
    }

    /// Map segments the peer created since the last call. Returns how many
    /// were added.
    fn discover(&self) -> usize {
        let Some(seg0) = self.segment_zero() else {
            return 0;
        };
        let next = seg0
            .next_segment_id()
            .load(Ordering::Acquire)
            .min(self.shared.layout.max_segments);
        let mut added = 0;
        for id in 1..next {
            if self.shared.segments.read().contains_key(&id) {
                continue;
            }
            // The creator may still be initializing; it shows up next time.
            if self.map_segment(id).is_ok() {
                added += 1;
            }
        }
        added
    }

    fn grow(&self) -> Option<Arc<Segment>> {
        let seg0 = self.segment_zero()?;
        let max = self.shared.layout.max_segments;
        let id = seg0
            .next_segment_id()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;

        let path = segment_path(&self.shared.prefix, id);
        match Segment::create(&path, id, &self.shared.layout) {
            Ok(segment) => {
                let segment = Arc::new(segment);
                self.shared.segments.write().insert(id, Arc::clone(&segment));
                info!(segment = id, "mapped new share memory segment");
                Some(segment)
            }
            Err(e) => {
                warn!(segment = id, error = %e, "failed to add share memory segment");
                None
            }
        }
    }

    /// Map segment `id`, or return the existing mapping.
    pub fn map_segment(&self, id: u32) -> Result<*mut u8> {
        Ok(self.segment(id)?.addr(0))
    }

    fn segment(&self, id: u32) -> Result<Arc<Segment>> {
        if let Some(segment) = self.shared.segments.read().get(&id) {
            return Ok(Arc::clone(segment));
        }
        if id >= self.shared.layout.max_segments {
            return Err(Error::SharedMemory(format!(
                "segment {id} is beyond the ceiling of {}",
                self.shared.layout.max_segments
            )));
        }

        let segment = Arc::new(Segment::attach(
            &segment_path(&self.shared.prefix, id),
            id,
        )?);
        let mut segments = self.shared.segments.write();
        let entry = segments.entry(id).or_insert_with(|| {
            debug!(segment = id, "mapped peer segment");
            segment
        });
        Ok(Arc::clone(entry))
    }

    /// Take ownership of a descriptor received from the peer.
    ///
    /// The descriptor is checked against the segment layout and the slab's
    /// state before any memory is touched.
    pub fn claim(&self, desc: BufferDescriptor) -> Result<ShmBuffer> {
        let segment = self.segment(desc.segment_id)?;
        let capacity = segment.check_allocated(desc.offset, desc.length)?;
        Ok(ShmBuffer {
            segment,
            offset: desc.offset,
            capacity,
            len: desc.length,
            owned: true,
        })
    }

    /// Return a descriptor's slab to its free list.
    pub fn free(&self, desc: BufferDescriptor) -> Result<()> {
        let mut buf = self.claim(desc)?;
        buf.owned = false;
        buf.segment.release(buf.offset)
    }

    /// Capacity and usage of every mapped segment.
    pub fn metrics(&self) -> ShareMemoryMetrics {
        self.discover();
        let segments = self.shared.segments.read();
        ShareMemoryMetrics {
            capacity_bytes: segments.values().map(|s| s.capacity_bytes()).sum(),
            in_use_bytes: segments.values().map(|s| s.in_use_bytes()).sum(),
            segment_count: segments.len() as u32,
        }
    }

    /// Ids of segments whose files this manager will unlink.
    pub fn owned_segments(&self) -> Vec<u32> {
        self.shared
            .segments
            .read()
            .iter()
            .filter(|(_, s)| s.file().is_owner())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Keep every segment file when this manager goes away.
    pub fn retain_files(&self) {
        for segment in self.shared.segments.read().values() {
            segment.file().retain();
        }
    }

    /// Become responsible for unlinking `ids`.
    ///
    /// Used by a hot-restart successor for segments its predecessor created.
    pub fn adopt_segments(&self, ids: &[u32]) -> Result<()> {
        for &id in ids {
            self.segment(id)?.file().adopt();
        }
        Ok(())
    }
}

/// A buffer allocated from, or claimed in, shared memory.
///
/// The slab returns to its free list when the buffer is dropped, unless it
/// was handed on with [`ShmBuffer::into_descriptor`].
pub struct ShmBuffer {
    segment: Arc<Segment>,
    offset: u32,
    capacity: u32,
    len: u32,
    owned: bool,
}

// SAFETY: the slab is exclusively owned by this handle; the segment mapping
// is shared but all shared bookkeeping is atomic.
#[allow(unsafe_code)]
unsafe impl Send for ShmBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for ShmBuffer {}

impl ShmBuffer {
    /// Valid bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether no bytes are valid.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slab size.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Set the number of valid bytes, clamped to the slab size.
    pub fn set_len(&mut self, len: usize) {
        self.len = u32::try_from(len).unwrap_or(u32::MAX).min(self.capacity);
    }

    /// Descriptor naming this buffer.
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            segment_id: self.segment.id(),
            offset: self.offset,
            length: self.len,
        }
    }

    /// Give up ownership, e.g. after publishing the descriptor on a queue.
    pub fn into_descriptor(mut self) -> BufferDescriptor {
        self.owned = false;
        self.descriptor()
    }

    /// Valid bytes.
    #[allow(unsafe_code)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: offset..offset+capacity is one slab inside the mapping and
        // this handle owns it.
        unsafe { std::slice::from_raw_parts(self.segment.addr(self.offset), self.len as usize) }
    }

    /// The whole slab, for filling before [`ShmBuffer::set_len`].
    #[allow(unsafe_code)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for as_slice; &mut self guarantees local exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.addr(self.offset),
                self.capacity as usize,
            )
        }
    }

    /// Copy `data` into the buffer and set the length.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity as usize);
        self.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        self.set_len(n);
        n
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        if self.owned
            && let Err(e) = self.segment.release(self.offset)
        {
            warn!(error = %e, "failed to release share memory buffer");
        }
    }
}

impl fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("descriptor", &self.descriptor())
            .field("capacity", &self.capacity)
            .finish()
    }
}
