//! The kernel's persistent-memory backend.
//!
//! Implements the [`PersistentMemory`] contract over the real arena: plain
//! loads and stores through the identity window, with `clflush` as the only
//! durability primitive and `sfence` as the ordering barrier.

use core::arch::x86_64::{_mm_clflush, _mm_sfence};

use log::info;
use pmem::{PersistentMemory, PmemPool};
use spinning_top::Spinlock;
use x86_64::PhysAddr;

use crate::memory::{self, SegmentAttributes};

/// Direct access to a physical memory range as persistent memory.
pub struct DirectPmem {
    base: u64,
    size: u64,
}

impl DirectPmem {
    /// The range must be mapped, unused by anything else, and (for real
    /// durability) backed by persistent media.
    pub fn new(base: PhysAddr, size: u64) -> Self {
        Self {
            base: base.as_u64(),
            size,
        }
    }

    fn check(&self, paddr: u64, len: usize) {
        debug_assert!(
            paddr >= self.base && paddr + len as u64 <= self.base + self.size,
            "pmem access [{paddr:#x}; {len}) outside the arena"
        );
    }
}

impl PersistentMemory for DirectPmem {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_bytes(&self, paddr: u64, buf: &mut [u8]) {
        self.check(paddr, buf.len());
        let src = memory::phys_to_virt(PhysAddr::new(paddr)).as_ptr::<u8>();
        unsafe {
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
    }

    fn write_bytes(&mut self, paddr: u64, bytes: &[u8]) {
        self.check(paddr, bytes.len());
        let dst = memory::phys_to_virt(PhysAddr::new(paddr)).as_mut_ptr::<u8>();
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    fn flush_line(&mut self, paddr: u64) {
        let line = memory::phys_to_virt(PhysAddr::new(paddr)).as_ptr::<u8>();
        unsafe {
            _mm_clflush(line);
        }
    }

    fn fence(&mut self) {
        unsafe {
            _mm_sfence();
        }
    }
}

struct PersistState {
    device: DirectPmem,
    pool: PmemPool,
}

/// Pool state. Taken only from boot context or with interrupts disabled;
/// never while holding the scheduler lock from below.
static PERSIST: Spinlock<Option<PersistState>> = Spinlock::new(None);

/// Map the arena, open (or format) the pool, and publish the backend.
pub fn init(base: PhysAddr, size: u64, is_nvdimm: bool) {
    memory::map_physical_region(
        memory::current_root(),
        base,
        size,
        SegmentAttributes::kernel_data(),
    );

    let mut device = DirectPmem::new(base, size);
    let (pool, formatted) = PmemPool::open_or_format(&mut device);
    info!(
        "pmem pool: {} pages, {} in use{}{}",
        pool.page_count(),
        pool.pages_in_use(&device),
        if formatted { ", freshly formatted" } else { "" },
        if is_nvdimm { "" } else { " (volatile dev arena)" },
    );

    let mut guard = PERSIST.lock();
    assert!(guard.is_none(), "persistent memory already initialized");
    *guard = Some(PersistState { device, pool });
}

/// Run `f` with the persistent-memory backend and pool.
///
/// Interrupts are disabled across the lock so the timer path can never
/// observe it held. The `expect` guards against use before [`init`], a
/// boot-order invariant.
pub fn with<R>(f: impl FnOnce(&mut DirectPmem, &PmemPool) -> R) -> R {
    let were_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();

    let result = {
        let mut guard = PERSIST.lock();
        let state = guard
            .as_mut()
            .expect("persistent memory has not been initialized");
        f(&mut state.device, &state.pool)
    };

    if were_enabled {
        x86_64::instructions::interrupts::enable();
    }
    result
}
