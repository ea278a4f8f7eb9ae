//! Embedded demo payload.
//!
//! A flat user-mode image that increments a counter in its data segment,
//! yielding after every step, then exits with the final count. Because the
//! counter lives in the checkpointed data segment, a power loss mid-run
//! resumes the count rather than restarting it.

use ember_abi as abi;

/// Exit code the payload reports after five increments.
pub const EXPECTED_EXIT_CODE: i64 = 5;

/// Virtual address of the demo's counter, for tests that want to peek.
pub const COUNTER_VADDR: u64 = abi::USER_DATA_BASE;

pub fn payload() -> &'static [u8] {
    &PAYLOAD
}

// Entered at USER_CODE_BASE with the syscall ABI from ember-abi:
//
//       mov  rbx, USER_DATA_BASE
// next: inc  qword ptr [rbx]
//       mov  eax, SYS_YIELD
//       int  0x80
//       cmp  qword ptr [rbx], 5
//       jb   next
//       mov  rdi, qword ptr [rbx]
//       mov  eax, SYS_EXIT
//       int  0x80
//       jmp  $
static PAYLOAD: [u8; 38] = [
    0x48, 0xBB, 0x00, 0x00, 0x00, 0x10, 0x00, 0x40, 0x00, 0x00, // mov rbx, 0x400010000000
    0x48, 0xFF, 0x03, // inc qword ptr [rbx]
    0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0xCD, 0x80, // int 0x80
    0x48, 0x83, 0x3B, 0x05, // cmp qword ptr [rbx], 5
    0x72, 0xF0, // jb -16 (back to the inc)
    0x48, 0x8B, 0x3B, // mov rdi, qword ptr [rbx]
    0xB8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
    0xCD, 0x80, // int 0x80
    0xEB, 0xFE, // jmp $
];

// The immediates above bake in the ABI; hold them to it.
const _: () = {
    assert!(abi::USER_DATA_BASE == 0x4000_1000_0000);
    assert!(abi::SYS_YIELD == 1);
    assert!(abi::SYS_EXIT == 0);
};
