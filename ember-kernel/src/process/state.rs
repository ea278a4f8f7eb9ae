//! Trap-frame capture into durable CPU contexts.

use core::arch::asm;

use pmem::CpuContext;
use zerocopy::FromZeros;

/// GPRs saved on the stack by the trap entry stub (matches push order).
#[repr(C)]
pub struct SavedGprs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Interrupt stack frame pushed by the CPU.
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// FXSAVE64 needs a 16-byte-aligned 512-byte area; the durable record only
/// guarantees 8, so state moves through this aligned bounce buffer.
#[repr(C, align(16))]
struct FxArea([u8; 512]);

fn fxsave_area() -> [u8; 512] {
    let mut area = FxArea([0; 512]);
    unsafe {
        asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr());
    }
    area.0
}

/// Restore FPU/SSE state captured by [`capture_cpu_context`].
///
/// # Safety
/// Must be followed by the return to the context the state belongs to,
/// without intervening floating-point use.
pub unsafe fn fxrstor(saved: &[u8; 512]) {
    let area = FxArea(*saved);
    unsafe {
        asm!("fxrstor64 [{}]", in(reg) area.0.as_ptr());
    }
}

/// Assemble a durable CPU context from the state a trap entry captured,
/// the FPU/SSE state as of now, and the context's own root page table.
pub fn capture_cpu_context(gprs: &SavedGprs, frame: &InterruptFrame, cr3: u64) -> CpuContext {
    let mut cpu = CpuContext::new_zeroed();
    cpu.rax = gprs.rax;
    cpu.rbx = gprs.rbx;
    cpu.rcx = gprs.rcx;
    cpu.rdx = gprs.rdx;
    cpu.rsi = gprs.rsi;
    cpu.rdi = gprs.rdi;
    cpu.rbp = gprs.rbp;
    cpu.r8 = gprs.r8;
    cpu.r9 = gprs.r9;
    cpu.r10 = gprs.r10;
    cpu.r11 = gprs.r11;
    cpu.r12 = gprs.r12;
    cpu.r13 = gprs.r13;
    cpu.r14 = gprs.r14;
    cpu.r15 = gprs.r15;
    cpu.rip = frame.rip;
    cpu.cs = frame.cs;
    cpu.rflags = frame.rflags;
    cpu.rsp = frame.rsp;
    cpu.ss = frame.ss;
    cpu.cr3 = cr3;
    cpu.fxsave = fxsave_area();
    cpu
}
