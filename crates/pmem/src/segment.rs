//! Durable segment mappings: a virtual range backed 1:1 by physical pages.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::{PersistentMemory, PersistentMemoryExt};
use crate::pool::PmemPool;
use crate::{PAGE_SIZE, PmemError};

/// Three durable words linking a virtual range to a physical range.
///
/// Either all three are zero (unused), or `paddr` is non-zero and `map_size`
/// is a positive multiple of the page size.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentMapping {
    pub vaddr: u64,
    pub paddr: u64,
    pub map_size: u64,
}

impl SegmentMapping {
    pub const fn unused() -> Self {
        Self {
            vaddr: 0,
            paddr: 0,
            map_size: 0,
        }
    }

    pub const fn new(vaddr: u64, paddr: u64, map_size: u64) -> Self {
        Self {
            vaddr,
            paddr,
            map_size,
        }
    }

    pub fn set(&mut self, vaddr: u64, paddr: u64, map_size: u64) {
        self.vaddr = vaddr;
        self.paddr = paddr;
        self.map_size = map_size;
    }

    pub fn clear(&mut self) {
        *self = Self::unused();
    }

    pub fn is_unused(&self) -> bool {
        self.vaddr == 0 && self.paddr == 0 && self.map_size == 0
    }

    /// The zero-or-valid invariant.
    pub fn is_well_formed(&self) -> bool {
        self.is_unused()
            || (self.paddr != 0 && self.map_size > 0 && self.map_size % PAGE_SIZE == 0)
    }

    /// Exclusive end of the virtual range.
    pub fn vaddr_end(&self) -> u64 {
        self.vaddr + self.map_size
    }

    pub fn contains_vaddr(&self, vaddr: u64) -> bool {
        !self.is_unused() && vaddr >= self.vaddr && vaddr < self.vaddr_end()
    }

    pub fn overlaps(&self, other: &SegmentMapping) -> bool {
        !self.is_unused()
            && !other.is_unused()
            && self.vaddr < other.vaddr_end()
            && other.vaddr < self.vaddr_end()
    }

    /// Draw `map_size` bytes of backing pages from the pool and set `paddr`.
    /// `vaddr` and `map_size` must already be populated.
    pub fn alloc_from_pool<P: PersistentMemory>(
        &mut self,
        pool: &PmemPool,
        pmem: &mut P,
    ) -> Result<(), PmemError> {
        assert!(
            self.map_size > 0 && self.map_size % PAGE_SIZE == 0,
            "segment size must be a positive page multiple before allocation"
        );
        self.paddr = pool.alloc_pages(pmem, self.map_size / PAGE_SIZE)?;
        Ok(())
    }
}

/// Persist a segment record at `record_paddr` so the triple becomes durable
/// as one unit.
pub fn store_segment<P: PersistentMemory>(
    pmem: &mut P,
    record_paddr: u64,
    segment: &SegmentMapping,
) {
    debug_assert!(segment.is_well_formed());
    pmem.persist_record(record_paddr, segment);
}

/// Persist the unused triple at `record_paddr`.
pub fn clear_segment<P: PersistentMemory>(pmem: &mut P, record_paddr: u64) {
    pmem.persist_record(record_paddr, &SegmentMapping::unused());
}

pub fn load_segment<P: PersistentMemory>(pmem: &P, record_paddr: u64) -> SegmentMapping {
    pmem.read_record(record_paddr)
}

/// Copy `src`'s contents into `dst`'s physical range, writing back every
/// destination line, and add the bytes moved to `copied`.
pub fn copy_segment_data<P: PersistentMemory>(
    pmem: &mut P,
    dst: &SegmentMapping,
    src: &SegmentMapping,
    copied: &mut u64,
) {
    if src.is_unused() && dst.is_unused() {
        return;
    }
    assert!(
        src.paddr != 0 && dst.paddr != 0 && dst.map_size >= src.map_size,
        "segment copy requires backed segments and a destination at least as large"
    );
    pmem.copy_flushed(dst.paddr, src.paddr, src.map_size);
    *copied += src.map_size;
}

/// Write back every cache line of the segment's physical range, adding the
/// line count to `flushes`. Unused segments are skipped.
pub fn flush_segment<P: PersistentMemory>(
    pmem: &mut P,
    segment: &SegmentMapping,
    flushes: &mut u64,
) {
    if segment.is_unused() {
        return;
    }
    *flushes += pmem.flush_range(segment.paddr, segment.map_size);
}

/// The four segments describing one address space.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProcessMappingInfo {
    pub code: SegmentMapping,
    pub data: SegmentMapping,
    pub stack: SegmentMapping,
    pub heap: SegmentMapping,
}

impl ProcessMappingInfo {
    pub const fn empty() -> Self {
        Self {
            code: SegmentMapping::unused(),
            data: SegmentMapping::unused(),
            stack: SegmentMapping::unused(),
            heap: SegmentMapping::unused(),
        }
    }

    pub fn segments(&self) -> [&SegmentMapping; 4] {
        [&self.code, &self.data, &self.stack, &self.heap]
    }

    /// The virtual ranges of the four segments must be pairwise disjoint.
    pub fn ranges_disjoint(&self) -> bool {
        let segments = self.segments();
        for (i, a) in segments.iter().enumerate() {
            for b in &segments[i + 1..] {
                if a.overlaps(b) {
                    return false;
                }
            }
        }
        true
    }
}
