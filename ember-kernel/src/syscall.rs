//! The syscall gate: a software-interrupt vector reachable from ring 3.
//!
//! The contract is three calls: `exit(code)`, `yield()` and `brk(delta)`,
//! with the number in `rax`, the argument in `rdi`, and the result written
//! back to `rax` (negative values are errors).

use log::warn;
use pmem::PmemError;

use crate::process::{InterruptFrame, SavedGprs};
use crate::scheduler::trap_entry;
use crate::{interrupts, scheduler};

use ember_abi as abi;

pub const SYSCALL_VECTOR: u8 = 0x80;

pub fn init() {
    let entry = trap_entry!(syscall_handler);
    interrupts::set_user_gate(SYSCALL_VECTOR, entry as usize as u64);
}

extern "sysv64" fn syscall_handler(gprs: *mut SavedGprs, frame: *const InterruptFrame) {
    let gprs_ref = unsafe { &mut *gprs };
    let number = gprs_ref.rax;
    let arg = gprs_ref.rdi;

    match number {
        abi::SYS_EXIT => unsafe { scheduler::exit_current(arg as i64) },
        abi::SYS_YIELD => {
            // The resumed process observes the return value from its
            // restored registers, so it is set before the checkpoint.
            gprs_ref.rax = 0;
            unsafe {
                scheduler::yield_from_trap(gprs, frame);
            }
        }
        abi::SYS_BRK => {
            gprs_ref.rax = match scheduler::expand_current_heap(arg as i64) {
                Ok(heap_end) => heap_end,
                Err(PmemError::HeapOverflow | PmemError::HeapUnderflow) => {
                    abi::ERR_HEAP_BOUNDS as u64
                }
                Err(error) => {
                    warn!("brk failed: {error}");
                    abi::ERR_NO_MEMORY as u64
                }
            };
        }
        _ => {
            warn!("unknown syscall {number}");
            gprs_ref.rax = abi::ERR_INVALID_SYSCALL as u64;
        }
    }
}
