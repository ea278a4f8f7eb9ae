//! GDT, TSS, and segment selector management.

use core::sync::atomic::{AtomicU16, Ordering};

use spinning_top::Spinlock;
use x86_64::{
    VirtAddr,
    instructions::tables::load_tss,
    registers::segmentation::{CS, DS, SS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

static GDT: Spinlock<GlobalDescriptorTable> = Spinlock::new(GlobalDescriptorTable::new());
static TSS: Spinlock<TaskStateSegment> = Spinlock::new(TaskStateSegment::new());

/// Segment selectors set during GDT initialization.
static KERNEL_CS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static KERNEL_DS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static USER_CS_SELECTOR: AtomicU16 = AtomicU16::new(0);
static USER_DS_SELECTOR: AtomicU16 = AtomicU16::new(0);

/// Get the kernel code segment selector. Must be called after init().
pub fn kernel_code_selector() -> SegmentSelector {
    SegmentSelector(KERNEL_CS_SELECTOR.load(Ordering::Relaxed))
}

/// Get the user code segment selector. Must be called after init().
pub fn user_code_selector() -> u16 {
    USER_CS_SELECTOR.load(Ordering::Relaxed)
}

/// Get the user data segment selector. Must be called after init().
pub fn user_data_selector() -> u16 {
    USER_DS_SELECTOR.load(Ordering::Relaxed)
}

const INTERRUPT_STACK_SIZE: usize = 16 * 1024;

#[repr(align(0x1000))]
struct InterruptStack([u8; INTERRUPT_STACK_SIZE]);

/// IST stack for faults that must run on a known-good stack (double fault,
/// page fault during early boot).
static EXCEPTION_STACK: InterruptStack = InterruptStack([0; INTERRUPT_STACK_SIZE]);

/// Ring 3 -> ring 0 transition stack used until the first process dispatch
/// replaces it with the process's kernel stack.
static BOOT_PRIVILEGE_STACK: InterruptStack = InterruptStack([0; INTERRUPT_STACK_SIZE]);

/// Initialize the GDT, TSS, and segment selectors.
pub fn init() {
    let mut tss = TSS.lock();
    // Stack table entries point at the TOP of each stack (stacks grow down).
    let privilege_top =
        BOOT_PRIVILEGE_STACK.0.as_ptr() as u64 + INTERRUPT_STACK_SIZE as u64;
    tss.privilege_stack_table[0] = VirtAddr::new(privilege_top);
    let exception_top = EXCEPTION_STACK.0.as_ptr() as u64 + INTERRUPT_STACK_SIZE as u64;
    tss.interrupt_stack_table[0] = VirtAddr::new(exception_top);
    drop(tss);

    let mut gdt = GDT.lock();
    let kernel_cs = gdt.append(Descriptor::kernel_code_segment());
    let kernel_ds = gdt.append(Descriptor::kernel_data_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.data_ptr() }));
    let user_ds = gdt.append(Descriptor::user_data_segment());
    let user_cs = gdt.append(Descriptor::user_code_segment());
    drop(gdt);

    KERNEL_CS_SELECTOR.store(kernel_cs.0, Ordering::Relaxed);
    KERNEL_DS_SELECTOR.store(kernel_ds.0, Ordering::Relaxed);
    USER_CS_SELECTOR.store(user_cs.0, Ordering::Relaxed);
    USER_DS_SELECTOR.store(user_ds.0, Ordering::Relaxed);

    unsafe {
        (*GDT.data_ptr()).load();
        CS::set_reg(kernel_cs);
        DS::set_reg(kernel_ds);
        SS::set_reg(kernel_ds);
        load_tss(tss_selector);
    }
}

/// Point the ring 3 -> ring 0 transition stack at the given kernel stack
/// top. Called at every dispatch of a userspace process.
pub fn set_privilege_stack(top: VirtAddr) {
    unsafe {
        (*TSS.data_ptr()).privilege_stack_table[0] = top;
    }
}
