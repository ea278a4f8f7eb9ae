//! Kernel-stack context switching.
//!
//! Every process owns a kernel stack. Suspending a process means parking
//! its callee-saved registers on that stack and recording the stack pointer;
//! resuming means the inverse. The same primitive suspends the root (pure
//! kernel) process and user processes frozen inside a trap handler.

use core::arch::naked_asm;

use x86_64::VirtAddr;

/// Saved kernel-side execution point: the stack pointer left by
/// [`switch_kernel_context`]. The callee-saved registers live on the stack
/// it points into.
#[repr(C)]
#[derive(Debug, Default)]
pub struct KernelContext {
    pub rsp: u64,
}

/// Park the current kernel execution in `save` and continue from `load`.
///
/// Returns when something later switches back to `save`.
///
/// # Safety
/// Both contexts must be valid: `load` must have been produced by a prior
/// switch or by [`seed_kernel_stack`], and interrupts must be disabled
/// across the call.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn switch_kernel_context(
    _save: *mut KernelContext,
    _load: *const KernelContext,
) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Seed a fresh kernel stack so the first switch onto it "returns" into
/// `entry`, with the stack alignment `entry` expects.
pub fn seed_kernel_stack(stack_top: VirtAddr, entry: extern "C" fn() -> !) -> KernelContext {
    let top = stack_top.as_u64() & !0xF;
    // Frame consumed by switch_kernel_context: six callee-saved registers,
    // then the return address. Laid out so `entry` starts with rsp % 16 == 8,
    // as after a call.
    let frame_base = top - 64;
    unsafe {
        let frame = frame_base as *mut u64;
        for slot in 0..6 {
            *frame.add(slot) = 0;
        }
        *frame.add(6) = entry as usize as u64;
    }
    KernelContext { rsp: frame_base }
}
