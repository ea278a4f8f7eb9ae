//! Page-table management and the segment materialiser.
//!
//! Page tables are walked directly through the identity window; entries are
//! edited with CR0.WP cleared because the firmware may have mapped its own
//! tables read-only. When a root lives in persistent memory the caller asks
//! for every touched page-table line to be written back.

use core::arch::x86_64::_mm_clflush;

use pmem::SegmentMapping;
use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr3};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::{allocate_frame, phys_to_virt};

/// Page attribute selection for a mapped segment.
///
/// Covers the attribute bits the mapping contract supports: Writable, User,
/// Write-through, Cache-disable and No-execute; Present is always set.
#[derive(Clone, Copy, Debug)]
pub struct SegmentAttributes {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    pub write_through: bool,
    pub cache_disable: bool,
}

impl SegmentAttributes {
    pub const fn user_code() -> Self {
        Self {
            writable: false,
            user: true,
            executable: true,
            write_through: false,
            cache_disable: false,
        }
    }

    pub const fn user_data() -> Self {
        Self {
            writable: true,
            user: true,
            executable: false,
            write_through: false,
            cache_disable: false,
        }
    }

    pub const fn kernel_data() -> Self {
        Self {
            writable: true,
            user: false,
            executable: false,
            write_through: false,
            cache_disable: false,
        }
    }

    pub const fn device() -> Self {
        Self {
            writable: true,
            user: false,
            executable: false,
            write_through: false,
            cache_disable: true,
        }
    }

    fn flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !self.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if self.write_through {
            flags |= PageTableFlags::WRITE_THROUGH;
        }
        if self.cache_disable {
            flags |= PageTableFlags::NO_CACHE;
        }
        flags
    }
}

/// Get the current root page table's physical address.
pub fn current_root() -> PhysAddr {
    Cr3::read().0.start_address()
}

/// Switch to a different root page table.
///
/// # Safety
/// The root must be valid and contain the kernel mappings.
pub unsafe fn switch_root(root: PhysAddr) {
    let frame = PhysFrame::from_start_address(root).unwrap();
    unsafe {
        Cr3::write(frame, Cr3::read().1);
    }
}

/// Create a root page table for a process.
///
/// Every PML4 entry of the current root is carried over, so the kernel
/// identity mappings (and anything mapped at boot, like the pmem arena and
/// the APIC page) stay reachable. Process segments land in PML4 slots the
/// boot mapping leaves empty.
///
/// Kernel mappings added after a root is created do not propagate; all
/// boot-time mapping therefore happens before the first process exists.
pub fn create_process_root() -> PhysAddr {
    let root = allocate_frame();
    unsafe {
        let src = &*phys_to_virt(current_root()).as_ptr::<PageTable>();
        let dst = &mut *phys_to_virt(root).as_mut_ptr::<PageTable>();
        for (index, entry) in src.iter().enumerate() {
            dst[index] = entry.clone();
        }
    }
    root
}

/// Install page-table entries covering `[vaddr, vaddr + map_size)` onto
/// `[paddr, paddr + map_size)` with the given attributes plus Present.
/// A null segment (`paddr == 0`) is skipped. With `should_flush`, every
/// touched page-table line is written back.
pub fn map_segment(
    root: PhysAddr,
    segment: &SegmentMapping,
    attrs: SegmentAttributes,
    should_flush: bool,
) {
    if segment.paddr == 0 {
        return;
    }
    assert!(
        segment.vaddr % 4096 == 0 && segment.paddr % 4096 == 0 && segment.map_size % 4096 == 0,
        "segment ranges must be page-aligned"
    );

    let flags = attrs.flags();
    for offset in (0..segment.map_size).step_by(4096) {
        map_page(
            root,
            VirtAddr::new(segment.vaddr + offset),
            PhysAddr::new(segment.paddr + offset),
            flags,
            should_flush,
        );
    }
}

/// Identity-map a physical region into `root`. Pages the firmware already
/// mapped (including via huge pages) are left alone.
pub fn map_physical_region(root: PhysAddr, base: PhysAddr, size: u64, attrs: SegmentAttributes) {
    assert!(base.as_u64() % 4096 == 0, "region must be page-aligned");
    let flags = attrs.flags();
    for offset in (0..size).step_by(4096) {
        let addr = base + offset;
        if is_mapped(root, VirtAddr::new(addr.as_u64())) {
            continue;
        }
        map_page(root, VirtAddr::new(addr.as_u64()), addr, flags, false);
    }
}

/// Whether `vaddr` already translates in `root` (huge pages included).
fn is_mapped(root: PhysAddr, vaddr: VirtAddr) -> bool {
    let mut table_ptr = phys_to_virt(root).as_ptr::<PageTable>();
    for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
        let entry = unsafe { &(*table_ptr)[index] };
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return false;
        }
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return true;
        }
        table_ptr = phys_to_virt(entry.addr()).as_ptr::<PageTable>();
    }
    let leaf = unsafe { &(*table_ptr)[vaddr.p1_index()] };
    leaf.flags().contains(PageTableFlags::PRESENT)
}

fn map_page(
    root: PhysAddr,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PageTableFlags,
    should_flush: bool,
) {
    // Intermediate entries carry the permissive flags; the leaf decides.
    let intermediate =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let mut table_ptr = phys_to_virt(root).as_mut_ptr::<PageTable>();
    for index in [vaddr.p4_index(), vaddr.p3_index(), vaddr.p2_index()] {
        let entry = unsafe { &mut (*table_ptr)[index] };
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            // Covered by a firmware huge page; nothing to install.
            return;
        }
        if entry.is_unused() {
            let frame = allocate_frame();
            with_writable_tables(|| entry.set_addr(frame, intermediate));
            flush_entry(entry, should_flush);
        } else if !entry.flags().contains(intermediate) {
            let merged = entry.flags() | intermediate;
            with_writable_tables(|| entry.set_flags(merged));
            flush_entry(entry, should_flush);
        }
        table_ptr = phys_to_virt(entry.addr()).as_mut_ptr::<PageTable>();
    }

    let leaf = unsafe { &mut (*table_ptr)[vaddr.p1_index()] };
    with_writable_tables(|| leaf.set_addr(paddr, flags));
    flush_entry(leaf, should_flush);

    if root == current_root() {
        tlb::flush(vaddr);
    }
}

/// Run `f` with CR0.WP cleared so ring-0 stores can edit page tables the
/// firmware mapped read-only.
fn with_writable_tables<R>(f: impl FnOnce() -> R) -> R {
    unsafe {
        Cr0::update(|flags| flags.remove(Cr0Flags::WRITE_PROTECT));
    }
    let result = f();
    unsafe {
        Cr0::update(|flags| flags.insert(Cr0Flags::WRITE_PROTECT));
    }
    result
}

fn flush_entry(entry: &PageTableEntry, should_flush: bool) {
    if should_flush {
        unsafe {
            _mm_clflush(entry as *const _ as *const u8);
        }
    }
}
