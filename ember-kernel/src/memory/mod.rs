//! Memory management.
//!
//! This module handles the kernel heap, frame allocation for page tables
//! and kernel stacks, and the page-table walker that materialises segment
//! mappings into live virtual memory.

use core::alloc::Layout;

use x86_64::{PhysAddr, VirtAddr};

mod heap;
pub mod paging;

pub use paging::{
    SegmentAttributes, create_process_root, current_root, map_physical_region, map_segment,
    switch_root,
};

/// The kernel runs on the firmware's identity mapping: virtual and physical
/// addresses coincide for everything the kernel touches directly. The two
/// helpers exist so the conversion sites stay explicit.
pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    VirtAddr::new(paddr.as_u64())
}

pub fn virt_to_phys(vaddr: VirtAddr) -> PhysAddr {
    PhysAddr::new(vaddr.as_u64())
}

/// Initialize the kernel heap.
///
/// # Safety
/// Must be called exactly once, with an identity-mapped region that nothing
/// else uses.
pub unsafe fn init(heap_base: usize, heap_size: usize) {
    unsafe {
        heap::init(heap_base, heap_size);
    }
}

/// Allocate a zeroed, page-aligned 4 KiB frame from the kernel heap.
///
/// Used for page tables; those frames stay with their address space for the
/// life of the process and are never reclaimed individually.
pub fn allocate_frame() -> PhysAddr {
    let layout = Layout::from_size_align(4096, 4096).unwrap();
    virt_to_phys(heap::allocate_zeroed(layout))
}

/// Allocate a zeroed kernel stack, returning its base.
pub fn allocate_kernel_stack(size: usize) -> VirtAddr {
    let layout = Layout::from_size_align(size, 4096).unwrap();
    heap::allocate_zeroed(layout)
}

/// Release a kernel stack allocated with [`allocate_kernel_stack`].
///
/// # Safety
/// The stack must no longer be in use by any execution path.
pub unsafe fn free_kernel_stack(base: VirtAddr, size: usize) {
    let layout = Layout::from_size_align(size, 4096).unwrap();
    unsafe {
        heap::deallocate(base, layout);
    }
}
