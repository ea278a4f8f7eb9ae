//! IDT setup: exception handlers plus raw gates for the timer and syscall
//! entry stubs.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use spinning_top::RwSpinlock;
use x86_64::{
    PrivilegeLevel, VirtAddr,
    instructions::interrupts,
    registers::control::Cr2,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::gdt;

static BREAKPOINT_INTERRUPT_COUNT: AtomicUsize = AtomicUsize::new(0);

static DESCRIPTOR_TABLE: RwSpinlock<InterruptDescriptorTable> =
    RwSpinlock::new(InterruptDescriptorTable::new());

/// Install a raw entry stub (a naked function) for an IRQ vector.
///
/// Vectors 0x00-0x1F are reserved for CPU exceptions.
pub fn set_raw_handler(vector: u8, entry: u64) {
    assert!(vector >= 0x20, "vectors 0x00-0x1F are reserved for exceptions");
    let mut descriptor_table = DESCRIPTOR_TABLE.write();
    unsafe {
        descriptor_table[vector]
            .set_handler_addr(VirtAddr::new(entry))
            .set_code_selector(gdt::kernel_code_selector());
    }
    drop(descriptor_table);
}

/// Install a raw entry stub reachable from ring 3 (the syscall gate).
pub fn set_user_gate(vector: u8, entry: u64) {
    assert!(vector >= 0x20, "vectors 0x00-0x1F are reserved for exceptions");
    let mut descriptor_table = DESCRIPTOR_TABLE.write();
    unsafe {
        descriptor_table[vector]
            .set_handler_addr(VirtAddr::new(entry))
            .set_code_selector(gdt::kernel_code_selector())
            .set_privilege_level(PrivilegeLevel::Ring3);
    }
    drop(descriptor_table);
}

extern "x86-interrupt" fn default_irq_handler(_stack_frame: InterruptStackFrame) {
    crate::apic::eoi();
}

pub fn init() {
    let mut descriptor_table = DESCRIPTOR_TABLE.write();
    let kernel_cs = gdt::kernel_code_selector();

    unsafe {
        descriptor_table
            .breakpoint
            .set_handler_fn(breakpoint_handler)
            .set_code_selector(kernel_cs);

        descriptor_table
            .invalid_opcode
            .set_handler_fn(invalid_opcode_handler)
            .set_code_selector(kernel_cs);

        descriptor_table
            .double_fault
            .set_handler_fn(double_fault_handler)
            .set_code_selector(kernel_cs)
            .set_stack_index(0);

        descriptor_table
            .general_protection_fault
            .set_handler_fn(gpf_handler)
            .set_code_selector(kernel_cs)
            .set_stack_index(0);

        descriptor_table
            .page_fault
            .set_handler_fn(page_fault_handler)
            .set_code_selector(kernel_cs)
            .set_stack_index(0);

        // Timer vector defaults to EOI-only until the scheduler installs
        // its preemption stub.
        descriptor_table[crate::apic::TIMER_VECTOR]
            .set_handler_fn(default_irq_handler)
            .set_code_selector(kernel_cs);
    }
    drop(descriptor_table);

    unsafe {
        (*DESCRIPTOR_TABLE.data_ptr()).load();
    }

    interrupts::enable();

    // Verify the table actually took effect before anything depends on it.
    interrupts::int3();
    let breakpoint_count = BREAKPOINT_INTERRUPT_COUNT.load(Ordering::SeqCst);
    assert_eq!(breakpoint_count, 1, "did not receive breakpoint interrupt");
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    debug!("BREAKPOINT: {stack_frame:?}");
    BREAKPOINT_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("Invalid opcode: {stack_frame:?}");
}

extern "x86-interrupt" fn gpf_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    panic!("General protection fault: error code {error_code}\n{stack_frame:?}");
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!("Double fault: error code {error_code}\n{stack_frame:?}");
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_address =
        Cr2::read().expect("CR2 contained non-canonical address while handling page fault");

    panic!(
        "Page fault:\n  Fault address:   {fault_address:#020x}\n  Current address: {:#020x}\n  Stack pointer:   {:#020x}\n  Caused by {} while executing in {} mode ({error_code:?})",
        stack_frame.instruction_pointer,
        stack_frame.stack_pointer,
        if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            "write"
        } else {
            "read"
        },
        if error_code.contains(PageFaultErrorCode::USER_MODE) {
            "user"
        } else {
            "kernel"
        }
    );
}
