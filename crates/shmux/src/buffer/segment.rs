//! Segment layout and the per-class slab free lists.
//!
//! ```text
//! +----------------------+ 0
//! | SegmentHeader        |
//! +----------------------+ META_START
//! | class 0 SlabMeta[n0] |
//! | class 1 SlabMeta[n1] |
//! | ...                  |
//! +----------------------+ aligned to SLAB_ALIGN
//! | class 0 data         |
//! | class 1 data         |
//! | ...                  |
//! +----------------------+ capacity
//! ```
//!
//! Free lists are Treiber stacks threaded through `SlabMeta::next`. The head
//! packs the slab index in the low 32 bits and an ABA tag in the high 32 bits.
//! Each slab carries a state word so that freeing twice, or claiming a slab
//! that is not allocated, is detected instead of corrupting the list.

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shm::ShmFile;
use crate::{Error, Result};

/// Segment file magic ("SHMS").
pub const SEGMENT_MAGIC: u32 = 0x5348_4D53;

/// Segment layout version.
pub const SEGMENT_VERSION: u32 = 1;

/// Most size classes a segment can hold.
pub const MAX_CLASSES: usize = 8;

/// Alignment of the data region and of every slab size.
pub const SLAB_ALIGN: usize = 64;

const FREE_LIST_END: u32 = u32::MAX;
const SLAB_FREE: u32 = 0;
const SLAB_ALLOCATED: u32 = 1;

#[repr(C)]
struct ClassHeader {
    slab_size: u32,
    slab_count: u32,
    meta_offset: u64,
    data_offset: u64,
    free_head: AtomicU64,
    free_count: AtomicU32,
    _pad: u32,
}

#[repr(C)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    segment_id: u32,
    class_count: u32,
    capacity: u64,
    max_segments: u32,
    /// Next id to hand out; only meaningful in segment 0.
    next_segment_id: AtomicU32,
    ready: AtomicU32,
    _pad: u32,
    classes: [ClassHeader; MAX_CLASSES],
}

#[repr(C)]
struct SlabMeta {
    next: AtomicU32,
    state: AtomicU32,
}

const META_START: usize = size_of::<SegmentHeader>().next_multiple_of(SLAB_ALIGN);

const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

const fn unpack(head: u64) -> (u32, u32) {
    (head as u32, (head >> 32) as u32)
}

/// Slab geometry of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLayout {
    /// Bytes per slab
    pub slab_size: u32,
    /// Number of slabs
    pub slab_count: u32,
}

/// Geometry shared by every segment of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Segment file size in bytes
    pub segment_size: usize,
    /// Size classes, smallest first
    pub classes: Vec<ClassLayout>,
    /// Ceiling on the number of segments
    pub max_segments: u32,
}

impl SegmentLayout {
    /// Split `segment_size` between size classes by percentage.
    ///
    /// `classes` holds `(slab_size, percent)` pairs; slab sizes are rounded up
    /// to [`SLAB_ALIGN`] and sorted.
    pub fn from_percentages(
        segment_size: usize,
        classes: &[(u32, u32)],
        max_segments: u32,
    ) -> Result<Self> {
        if classes.is_empty() || classes.len() > MAX_CLASSES {
            return Err(Error::Config(format!(
                "between 1 and {MAX_CLASSES} size classes are required, got {}",
                classes.len()
            )));
        }
        let total_percent: u32 = classes.iter().map(|(_, p)| *p).sum();
        if total_percent == 0 || total_percent > 100 {
            return Err(Error::Config(format!(
                "size class percentages must sum to 1..=100, got {total_percent}"
            )));
        }

        let mut sorted: Vec<(u32, u32)> = classes
            .iter()
            .map(|&(size, pct)| (align_slab(size), pct))
            .collect();
        sorted.sort_unstable_by_key(|(size, _)| *size);

        // Slab metadata and data both come out of the same budget.
        let usable = segment_size.saturating_sub(META_START + SLAB_ALIGN);
        let classes: Vec<ClassLayout> = sorted
            .iter()
            .map(|&(slab_size, pct)| {
                let budget = usable * pct as usize / 100;
                let per_slab = slab_size as usize + size_of::<SlabMeta>();
                ClassLayout {
                    slab_size,
                    slab_count: u32::try_from(budget / per_slab).unwrap_or(u32::MAX),
                }
            })
            .collect();

        if classes.iter().all(|c| c.slab_count == 0) {
            return Err(Error::Config(format!(
                "segment size {segment_size} is too small for any slab"
            )));
        }

        let layout = Self {
            segment_size,
            classes,
            max_segments,
        };
        layout.offsets()?;
        Ok(layout)
    }

    /// Largest slab size.
    pub fn max_slab_size(&self) -> u32 {
        self.classes
            .iter()
            .filter(|c| c.slab_count > 0)
            .map(|c| c.slab_size)
            .max()
            .unwrap_or(0)
    }

    /// Meta and data offsets per class.
    fn offsets(&self) -> Result<Vec<(usize, usize)>> {
        let mut meta = META_START;
        let mut metas = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            metas.push(meta);
            meta += class.slab_count as usize * size_of::<SlabMeta>();
        }

        let mut data = meta.next_multiple_of(SLAB_ALIGN);
        let mut out = Vec::with_capacity(self.classes.len());
        for (class, meta_offset) in self.classes.iter().zip(metas) {
            out.push((meta_offset, data));
            data += class.slab_count as usize * class.slab_size as usize;
        }

        if data > self.segment_size || data > u32::MAX as usize {
            return Err(Error::Config(format!(
                "slab layout needs {data} bytes but segments are {} bytes",
                self.segment_size
            )));
        }
        Ok(out)
    }
}

fn align_slab(size: u32) -> u32 {
    size.max(1).next_multiple_of(SLAB_ALIGN as u32)
}

#[derive(Debug, Clone, Copy)]
struct ClassView {
    slab_size: u32,
    slab_count: u32,
    meta_offset: usize,
    data_offset: usize,
}

impl ClassView {
    fn contains(&self, offset: usize) -> bool {
        offset >= self.data_offset
            && offset < self.data_offset + self.slab_count as usize * self.slab_size as usize
    }
}

/// One mapped segment.
#[derive(Debug)]
pub struct Segment {
    id: u32,
    file: ShmFile,
    classes: Vec<ClassView>,
}

// SAFETY: all cross-thread state inside the mapping is accessed through
// atomics; the remaining header fields are immutable once `ready` is set.
#[allow(unsafe_code)]
unsafe impl Send for Segment {}
#[allow(unsafe_code)]
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and initialize segment `id` at `path`.
    #[allow(unsafe_code)]
    pub fn create(path: &Path, id: u32, layout: &SegmentLayout) -> Result<Self> {
        let offsets = layout.offsets()?;
        let file = ShmFile::create(path, layout.segment_size, |base, len| {
            if len < META_START {
                return Err(Error::SharedMemory(format!(
                    "segment of {len} bytes cannot hold its header"
                )));
            }
            // SAFETY: the mapping is page aligned, at least META_START bytes
            // long and not yet visible to any other process.
            let header = unsafe { &mut *base.cast::<SegmentHeader>() };
            header.magic = SEGMENT_MAGIC;
            header.version = SEGMENT_VERSION;
            header.segment_id = id;
            header.class_count = layout.classes.len() as u32;
            header.capacity = len as u64;
            header.max_segments = layout.max_segments;
            header.next_segment_id = AtomicU32::new(1);

            for (i, (class, (meta_offset, data_offset))) in
                layout.classes.iter().zip(&offsets).enumerate()
            {
                let ch = &mut header.classes[i];
                ch.slab_size = class.slab_size;
                ch.slab_count = class.slab_count;
                ch.meta_offset = *meta_offset as u64;
                ch.data_offset = *data_offset as u64;
                ch.free_count = AtomicU32::new(class.slab_count);

                for slab in 0..class.slab_count {
                    // SAFETY: offsets() checked that every meta entry lies
                    // inside the segment.
                    let meta = unsafe {
                        &mut *base
                            .add(*meta_offset + slab as usize * size_of::<SlabMeta>())
                            .cast::<SlabMeta>()
                    };
                    let next = if slab + 1 < class.slab_count {
                        slab + 1
                    } else {
                        FREE_LIST_END
                    };
                    meta.next = AtomicU32::new(next);
                    meta.state = AtomicU32::new(SLAB_FREE);
                }
                let first = if class.slab_count > 0 { 0 } else { FREE_LIST_END };
                ch.free_head = AtomicU64::new(pack(first, 0));
            }
            header.ready.store(1, Ordering::Release);
            Ok(())
        })?;

        Self::from_file(file, id)
    }

    /// Map an existing segment and check that it is the one expected.
    pub fn attach(path: &Path, id: u32) -> Result<Self> {
        let file = ShmFile::open(path, META_START)?;
        Self::from_file(file, id)
    }

    #[allow(unsafe_code)]
    fn from_file(file: ShmFile, id: u32) -> Result<Self> {
        // SAFETY: open/create guarantee at least META_START mapped bytes.
        let header = unsafe { &*file.as_ptr().cast::<SegmentHeader>() };
        if header.magic != SEGMENT_MAGIC || header.version != SEGMENT_VERSION {
            return Err(Error::SharedMemory(format!(
                "{} is not a segment file",
                file.path().display()
            )));
        }
        if header.ready.load(Ordering::Acquire) != 1 {
            return Err(Error::SharedMemory(format!(
                "{} is not initialized",
                file.path().display()
            )));
        }
        if header.segment_id != id {
            return Err(Error::SharedMemory(format!(
                "{} holds segment {} instead of {id}",
                file.path().display(),
                header.segment_id
            )));
        }
        if header.capacity != file.len() as u64 || header.class_count as usize > MAX_CLASSES {
            return Err(Error::SharedMemory(format!(
                "{} has an inconsistent header",
                file.path().display()
            )));
        }

        let mut classes = Vec::with_capacity(header.class_count as usize);
        for ch in &header.classes[..header.class_count as usize] {
            let view = ClassView {
                slab_size: ch.slab_size,
                slab_count: ch.slab_count,
                meta_offset: ch.meta_offset as usize,
                data_offset: ch.data_offset as usize,
            };
            let meta_end = view.meta_offset + view.slab_count as usize * size_of::<SlabMeta>();
            let data_end = view.data_offset + view.slab_count as usize * view.slab_size as usize;
            if meta_end > file.len()
                || data_end > file.len()
                || view.meta_offset % align_of::<SlabMeta>() != 0
            {
                return Err(Error::SharedMemory(format!(
                    "{} has a class outside the mapping",
                    file.path().display()
                )));
            }
            classes.push(view);
        }

        Ok(Self { id, file, classes })
    }

    /// Segment id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Backing file.
    pub fn file(&self) -> &ShmFile {
        &self.file
    }

    /// Recover the layout this segment was created with.
    pub fn layout(&self) -> SegmentLayout {
        SegmentLayout {
            segment_size: self.file.len(),
            classes: self
                .classes
                .iter()
                .map(|c| ClassLayout {
                    slab_size: c.slab_size,
                    slab_count: c.slab_count,
                })
                .collect(),
            max_segments: self.header().max_segments,
        }
    }

    #[allow(unsafe_code)]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: validated in from_file; the mapping lives as long as self.
        unsafe { &*self.file.as_ptr().cast::<SegmentHeader>() }
    }

    /// Segment id allocator. Only segment 0's counter is authoritative.
    pub fn next_segment_id(&self) -> &AtomicU32 {
        &self.header().next_segment_id
    }

    #[allow(unsafe_code)]
    fn meta(&self, class: &ClassView, slab: u32) -> &SlabMeta {
        debug_assert!(slab < class.slab_count);
        // SAFETY: from_file checked the meta array lies inside the mapping.
        unsafe {
            &*self
                .file
                .as_ptr()
                .add(class.meta_offset + slab as usize * size_of::<SlabMeta>())
                .cast::<SlabMeta>()
        }
    }

    /// Number of size classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Slab size of class `class`.
    pub fn slab_size(&self, class: usize) -> u32 {
        self.classes.get(class).map_or(0, |c| c.slab_size)
    }

    /// Pop a free slab from `class`. Returns its offset in the segment.
    pub fn try_alloc(&self, class: usize) -> Option<u32> {
        let view = self.classes.get(class)?;
        let ch = &self.header().classes[class];
        loop {
            let head = ch.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack(head);
            if index == FREE_LIST_END || index >= view.slab_count {
                return None;
            }
            let meta = self.meta(view, index);
            let next = meta.next.load(Ordering::Acquire);
            if ch
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(next, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                meta.state.store(SLAB_ALLOCATED, Ordering::Release);
                ch.free_count.fetch_sub(1, Ordering::AcqRel);
                return Some((view.data_offset + index as usize * view.slab_size as usize) as u32);
            }
            std::hint::spin_loop();
        }
    }

    /// Resolve an offset to `(class, slab)`; the offset must be the start of
    /// a slab.
    fn locate(&self, offset: u32) -> Result<(usize, u32)> {
        let offset = offset as usize;
        for (i, view) in self.classes.iter().enumerate() {
            if view.contains(offset) {
                let rel = offset - view.data_offset;
                if rel % view.slab_size as usize != 0 {
                    return Err(Error::SharedMemory(format!(
                        "offset {offset} in segment {} is not slab aligned",
                        self.id
                    )));
                }
                return Ok((i, (rel / view.slab_size as usize) as u32));
            }
        }
        Err(Error::SharedMemory(format!(
            "offset {offset} is outside segment {} data",
            self.id
        )))
    }

    /// Validate a descriptor received from the peer. Returns the slab size.
    pub fn check_allocated(&self, offset: u32, length: u32) -> Result<u32> {
        let (class, slab) = self.locate(offset)?;
        let view = &self.classes[class];
        if length > view.slab_size {
            return Err(Error::SharedMemory(format!(
                "length {length} exceeds slab size {} in segment {}",
                view.slab_size, self.id
            )));
        }
        if self.meta(view, slab).state.load(Ordering::Acquire) != SLAB_ALLOCATED {
            return Err(Error::SharedMemory(format!(
                "slab at offset {offset} in segment {} is not allocated",
                self.id
            )));
        }
        Ok(view.slab_size)
    }

    /// Return a slab to its free list.
    pub fn release(&self, offset: u32) -> Result<()> {
        let (class, slab) = self.locate(offset)?;
        let view = &self.classes[class];
        let meta = self.meta(view, slab);
        if meta
            .state
            .compare_exchange(
                SLAB_ALLOCATED,
                SLAB_FREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::SharedMemory(format!(
                "double free of offset {offset} in segment {}",
                self.id
            )));
        }

        let ch = &self.header().classes[class];
        loop {
            let head = ch.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack(head);
            meta.next.store(index, Ordering::Release);
            if ch
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(slab, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                ch.free_count.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Local address of `offset`.
    #[allow(unsafe_code)]
    pub fn addr(&self, offset: u32) -> *mut u8 {
        debug_assert!((offset as usize) < self.file.len());
        // SAFETY: callers only pass offsets validated by locate().
        unsafe { self.file.as_ptr().add(offset as usize) }
    }

    /// Slab bytes in this segment.
    pub fn capacity_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|c| u64::from(c.slab_size) * u64::from(c.slab_count))
            .sum()
    }

    /// Bytes in allocated slabs, as seen by both processes.
    pub fn in_use_bytes(&self) -> u64 {
        let header = self.header();
        self.classes
            .iter()
            .zip(&header.classes)
            .map(|(c, ch)| {
                let free = ch.free_count.load(Ordering::Acquire).min(c.slab_count);
                u64::from(c.slab_size) * u64::from(c.slab_count - free)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small_layout() -> SegmentLayout {
        SegmentLayout::from_percentages(64 * 1024, &[(4096, 50), (16384, 50)], 4).unwrap()
    }

    #[test]
    fn test_layout_sorts_and_aligns_classes() {
        let layout =
            SegmentLayout::from_percentages(1024 * 1024, &[(16384, 30), (1000, 70)], 1).unwrap();
        assert_eq!(layout.classes[0].slab_size, 1024);
        assert_eq!(layout.classes[1].slab_size, 16384);
        assert!(layout.classes.iter().all(|c| c.slab_count > 0));
        assert_eq!(layout.max_slab_size(), 16384);
    }

    #[test]
    fn test_layout_rejects_bad_percentages() {
        assert!(SegmentLayout::from_percentages(65536, &[(4096, 80), (8192, 40)], 1).is_err());
        assert!(SegmentLayout::from_percentages(65536, &[], 1).is_err());
        assert!(SegmentLayout::from_percentages(1024, &[(4096, 100)], 1).is_err());
    }

    #[test]
    fn test_alloc_until_exhausted_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let layout = small_layout();
        let seg = Segment::create(&dir.path().join("seg0"), 0, &layout).unwrap();
        let count = layout.classes[0].slab_count as usize;

        let offsets: Vec<u32> = (0..count).map(|_| seg.try_alloc(0).unwrap()).collect();
        assert_eq!(seg.try_alloc(0), None);

        let mut unique = offsets.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), count);

        seg.release(offsets[3]).unwrap();
        assert_eq!(seg.try_alloc(0), Some(offsets[3]));
    }

    #[test]
    fn test_double_free_detected() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg0"), 0, &small_layout()).unwrap();
        let offset = seg.try_alloc(1).unwrap();
        seg.release(offset).unwrap();
        assert!(matches!(seg.release(offset), Err(Error::SharedMemory(_))));
    }

    #[test]
    fn test_check_allocated_rejects_bad_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg0"), 0, &small_layout()).unwrap();
        let offset = seg.try_alloc(0).unwrap();

        assert_eq!(seg.check_allocated(offset, 4096).unwrap(), 4096);
        assert!(seg.check_allocated(offset, 4097).is_err());
        assert!(seg.check_allocated(offset + 1, 10).is_err());
        assert!(seg.check_allocated(0, 10).is_err());

        let free_offset = seg.try_alloc(0).unwrap();
        seg.release(free_offset).unwrap();
        assert!(seg.check_allocated(free_offset, 10).is_err());
    }

    #[test]
    fn test_attach_sees_shared_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0");
        let layout = small_layout();
        let owner = Segment::create(&path, 0, &layout).unwrap();
        let peer = Segment::attach(&path, 0).unwrap();
        assert_eq!(peer.layout(), layout);

        let offset = owner.try_alloc(0).unwrap();
        assert_eq!(peer.in_use_bytes(), 4096);
        peer.release(offset).unwrap();
        assert_eq!(owner.in_use_bytes(), 0);

        assert!(Segment::attach(&path, 1).is_err());
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let dir = tempfile::tempdir().unwrap();
        let seg = std::sync::Arc::new(
            Segment::create(&dir.path().join("seg0"), 0, &small_layout()).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seg = seg.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(offset) = seg.try_alloc(0) {
                            seg.release(offset).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seg.in_use_bytes(), 0);
    }
}
