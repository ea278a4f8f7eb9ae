//! UEFI boot collaborator: kernel-heap carve-out, boot-services exit, and
//! discovery of the persistent-memory arena from the firmware memory map.

use log::info;
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::{MemoryMap, MemoryMapOwned};
use x86_64::PhysAddr;

/// Kernel heap size, allocated from UEFI while boot services are live.
const KERNEL_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Size of the arena used for process records and segments. Larger firmware
/// regions are clipped to what the pool descriptor can track.
const PMEM_ARENA_SIZE: u64 = 64 * 1024 * 1024;

pub struct BootInfo {
    pub heap_base: usize,
    pub heap_size: usize,
    pub pmem_base: PhysAddr,
    pub pmem_size: u64,
    /// Whether the arena came from a real persistent-memory descriptor.
    pub pmem_is_nvdimm: bool,
}

pub fn init() {
    ::uefi::helpers::init().expect("could not initialize UEFI helpers");
}

/// Leave boot services and collect everything the kernel needs from the
/// firmware: a heap region and the persistent-memory arena.
pub fn exit_boot_services() -> BootInfo {
    let heap = boot::allocate_pages(
        AllocateType::AnyPages,
        MemoryType::LOADER_DATA,
        KERNEL_HEAP_SIZE / 4096,
    )
    .expect("could not allocate the kernel heap");
    let heap_base = heap.as_ptr() as usize;

    let memory_map = unsafe { boot::exit_boot_services(None) };
    let (pmem_base, pmem_size, pmem_is_nvdimm) = find_pmem_arena(&memory_map);

    BootInfo {
        heap_base,
        heap_size: KERNEL_HEAP_SIZE,
        pmem_base,
        pmem_size,
        pmem_is_nvdimm,
    }
}

/// Locate the persistent-memory arena.
///
/// The boot contract is that the firmware tells us where durable memory
/// lives: the largest `PERSISTENT_MEMORY` descriptor wins. Without one (a
/// development machine or plain QEMU), the top of the largest conventional
/// region is carved out instead - the arena then survives a kernel restart
/// but not a power cycle.
fn find_pmem_arena(memory_map: &MemoryMapOwned) -> (PhysAddr, u64, bool) {
    let mut best_nvdimm: Option<(u64, u64)> = None;
    let mut best_conventional: Option<(u64, u64)> = None;

    for descriptor in memory_map.entries() {
        let size = descriptor.page_count * 4096;
        let candidate = Some((descriptor.phys_start, size));
        match descriptor.ty {
            MemoryType::PERSISTENT_MEMORY => {
                if best_nvdimm.is_none_or(|(_, best)| size > best) {
                    best_nvdimm = candidate;
                }
            }
            MemoryType::CONVENTIONAL => {
                if best_conventional.is_none_or(|(_, best)| size > best) {
                    best_conventional = candidate;
                }
            }
            _ => {}
        }
    }

    if let Some((base, size)) = best_nvdimm {
        info!("pmem arena: {:#x} ({} MiB, nvdimm)", base, size >> 20);
        return (PhysAddr::new(base), size.min(PMEM_ARENA_SIZE), true);
    }

    let (base, size) = best_conventional.expect("no usable memory for the pmem arena");
    assert!(
        size >= 2 * PMEM_ARENA_SIZE,
        "not enough conventional memory to carve a pmem arena"
    );
    let arena_base = base + size - PMEM_ARENA_SIZE;
    info!(
        "pmem arena: {:#x} ({} MiB, carved from conventional memory)",
        arena_base,
        PMEM_ARENA_SIZE >> 20
    );
    (PhysAddr::new(arena_base), PMEM_ARENA_SIZE, false)
}
