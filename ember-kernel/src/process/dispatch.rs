//! First dispatch into user mode from a durable context slot.
//!
//! A freshly created or recovered process has no frozen kernel stack to
//! unwind, so its kernel stack is seeded to enter here: the working slot's
//! CPU context is read back from persistent memory and restored with an
//! `iretq` built from the record.

use core::arch::naked_asm;
use core::mem::offset_of;

use pmem::CpuContext;
use x86_64::{PhysAddr, VirtAddr};

use crate::{apic, gdt, memory, persist, scheduler};

use super::state;

/// Entry point seeded onto fresh kernel stacks. Runs with interrupts
/// disabled on the process's own kernel stack.
pub extern "C" fn user_entry_trampoline() -> ! {
    let record = scheduler::with_current_process(|process| {
        process
            .record()
            .expect("only persistent processes are dispatched through the trampoline")
    });
    let ctx = persist::with(|pmem, _| {
        let slot = record
            .working_slot(pmem)
            .expect("dispatched record is published");
        slot.load(pmem)
    });

    unsafe {
        memory::switch_root(PhysAddr::new(ctx.cpu.cr3));
        gdt::set_privilege_stack(VirtAddr::new(ctx.kernel_rsp));
        apic::set_timer_oneshot(scheduler::TIME_SLICE_MS);
        state::fxrstor(&ctx.cpu.fxsave);
        restore_cpu_context(&ctx.cpu)
    }
}

// The restore stub below indexes CpuContext with literal offsets.
const _: () = {
    assert!(offset_of!(CpuContext, rax) == 0x00);
    assert!(offset_of!(CpuContext, rdi) == 0x28);
    assert!(offset_of!(CpuContext, r15) == 0x70);
    assert!(offset_of!(CpuContext, rip) == 0x78);
    assert!(offset_of!(CpuContext, cs) == 0x80);
    assert!(offset_of!(CpuContext, rflags) == 0x88);
    assert!(offset_of!(CpuContext, rsp) == 0x90);
    assert!(offset_of!(CpuContext, ss) == 0x98);
};

/// Restore every register from a `CpuContext` and return to it with `iretq`.
///
/// `iretq` rather than `sysretq`: it restores RCX and R11 like any other
/// register and reloads CS/SS/RFLAGS/RSP from the saved frame, so any
/// interrupted instruction sequence resumes exactly.
///
/// # Safety
/// The context must describe a resumable state whose address space is
/// already installed.
#[unsafe(naked)]
unsafe extern "sysv64" fn restore_cpu_context(_ctx: *const CpuContext) -> ! {
    // CpuContext layout (offsets in bytes):
    //   0x00: rax, 0x08: rbx, 0x10: rcx, 0x18: rdx
    //   0x20: rsi, 0x28: rdi, 0x30: rbp, 0x38: r8
    //   0x40: r9,  0x48: r10, 0x50: r11, 0x58: r12
    //   0x60: r13, 0x68: r14, 0x70: r15, 0x78: rip
    //   0x80: cs,  0x88: rflags, 0x90: rsp, 0x98: ss
    naked_asm!(
        // rdi = context pointer; keep it in r15 while restoring the rest.
        "mov r15, rdi",
        // Build the iretq frame (pushed in reverse: SS, RSP, RFLAGS, CS, RIP).
        "push qword ptr [r15 + 0x98]",
        "push qword ptr [r15 + 0x90]",
        "push qword ptr [r15 + 0x88]",
        "push qword ptr [r15 + 0x80]",
        "push qword ptr [r15 + 0x78]",
        "mov rax, [r15 + 0x00]",
        "mov rbx, [r15 + 0x08]",
        "mov rcx, [r15 + 0x10]",
        "mov rdx, [r15 + 0x18]",
        "mov rsi, [r15 + 0x20]",
        "mov rbp, [r15 + 0x30]",
        "mov r8,  [r15 + 0x38]",
        "mov r9,  [r15 + 0x40]",
        "mov r10, [r15 + 0x48]",
        "mov r11, [r15 + 0x50]",
        "mov r12, [r15 + 0x58]",
        "mov r13, [r15 + 0x60]",
        "mov r14, [r15 + 0x68]",
        // rdi last-but-one, r15 last (it held the pointer).
        "mov rdi, [r15 + 0x28]",
        "mov r15, [r15 + 0x70]",
        "iretq",
    )
}
