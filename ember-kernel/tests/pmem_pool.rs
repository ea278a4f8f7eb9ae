#![no_std]
#![no_main]

extern crate alloc;

use core::alloc::Layout;

use ember_kernel::persist::DirectPmem;
use pmem::{PAGE_SIZE, PersistentMemory, PersistentMemoryExt, PmemError, PmemPool};
use x86_64::PhysAddr;

ember_kernel::test_harness!(
    format_and_reopen,
    allocations_do_not_overlap,
    exhaustion_is_an_error,
    typed_records_survive_flush,
);

/// A scratch arena carved from the kernel heap: identity-mapped ordinary
/// RAM, but exercised through the real clflush/sfence path.
fn scratch_arena(pages: usize) -> DirectPmem {
    let layout = Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
    let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null());
    DirectPmem::new(PhysAddr::new(base as u64), (pages as u64) * PAGE_SIZE)
}

fn format_and_reopen() {
    let mut arena = scratch_arena(32);
    assert!(PmemPool::open(&arena).is_none());

    let pool = PmemPool::format(&mut arena);
    assert_eq!(pool.page_count(), 32);
    assert_eq!(pool.pages_in_use(&arena), 1);

    let reopened = PmemPool::open(&arena).expect("formatted pool reopens");
    assert_eq!(reopened.page_count(), 32);
}

fn allocations_do_not_overlap() {
    let mut arena = scratch_arena(32);
    let pool = PmemPool::format(&mut arena);

    let first = pool.alloc_pages(&mut arena, 4).unwrap();
    let second = pool.alloc_pages(&mut arena, 4).unwrap();
    assert_eq!(first % PAGE_SIZE, 0);
    assert_eq!(second % PAGE_SIZE, 0);
    assert!(second >= first + 4 * PAGE_SIZE || first >= second + 4 * PAGE_SIZE);
}

fn exhaustion_is_an_error() {
    let mut arena = scratch_arena(8);
    let pool = PmemPool::format(&mut arena);
    assert!(pool.alloc_pages(&mut arena, 7).is_ok());
    assert_eq!(pool.alloc_pages(&mut arena, 1), Err(PmemError::Exhausted));
}

fn typed_records_survive_flush() {
    let mut arena = scratch_arena(8);
    let base = arena.base() + PAGE_SIZE;
    let value: u64 = 0x1234_5678_9abc_def0;
    arena.persist_record(base, &value);
    assert_eq!(arena.read_record::<u64>(base), value);
}
