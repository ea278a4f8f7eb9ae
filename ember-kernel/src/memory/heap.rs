use core::alloc::Layout;

use linked_list_allocator::LockedHeap;
use x86_64::VirtAddr;

#[global_allocator]
static GLOBAL_ALLOCATOR: LockedHeap = LockedHeap::empty();

pub unsafe fn init(heap_start: usize, heap_size: usize) {
    unsafe {
        GLOBAL_ALLOCATOR
            .lock()
            .init(heap_start as *mut u8, heap_size);
    }
}

pub fn allocate_zeroed(layout: Layout) -> VirtAddr {
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "kernel heap exhausted");
    VirtAddr::new(ptr as u64)
}

pub unsafe fn deallocate(addr: VirtAddr, layout: Layout) {
    unsafe {
        alloc::alloc::dealloc(addr.as_mut_ptr(), layout);
    }
}
