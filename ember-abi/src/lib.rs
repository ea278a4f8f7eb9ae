//! Shared ABI definitions between ember-kernel and userspace payloads.
//!
//! This crate contains syscall numbers, error codes, and the user
//! address-space layout that both sides need to agree on.

#![no_std]

// =============================================================================
// Syscall numbers
// =============================================================================

/// Terminate the calling process. `rdi` carries the exit code.
pub const SYS_EXIT: u64 = 0;

/// Give up the CPU. Always returns 0.
pub const SYS_YIELD: u64 = 1;

/// Move the heap watermark by the signed delta in `rdi`.
/// Returns the new end of the heap, or a negative error code.
pub const SYS_BRK: u64 = 2;

// =============================================================================
// Error codes (returned in rax as negative values)
// =============================================================================

/// Unknown syscall number.
pub const ERR_INVALID_SYSCALL: i64 = -1;

/// The kernel could not satisfy an allocation.
pub const ERR_NO_MEMORY: i64 = -2;

/// A `brk` call would move the watermark outside the heap segment.
pub const ERR_HEAP_BOUNDS: i64 = -3;

// =============================================================================
// User address-space layout
// =============================================================================

pub const PAGE_SIZE: u64 = 4096;

/// Base of the code segment. All user segments live under PML4 entry 128,
/// well clear of the boot identity mappings in the low gigabytes.
pub const USER_CODE_BASE: u64 = 0x4000_0000_0000;
pub const USER_DATA_BASE: u64 = 0x4000_1000_0000;
pub const USER_STACK_BASE: u64 = 0x4000_2000_0000;
pub const USER_HEAP_BASE: u64 = 0x4000_3000_0000;

/// Default segment sizes for a freshly created process.
pub const USER_CODE_SIZE: u64 = 4 * PAGE_SIZE;
pub const USER_DATA_SIZE: u64 = 4 * PAGE_SIZE;
pub const USER_STACK_SIZE: u64 = 4 * PAGE_SIZE;
pub const USER_HEAP_SIZE: u64 = 4 * PAGE_SIZE;

/// Initial user stack pointer: the exclusive top of the stack segment.
pub const USER_STACK_TOP: u64 = USER_STACK_BASE + USER_STACK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges() -> [(u64, u64); 4] {
        [
            (USER_CODE_BASE, USER_CODE_SIZE),
            (USER_DATA_BASE, USER_DATA_SIZE),
            (USER_STACK_BASE, USER_STACK_SIZE),
            (USER_HEAP_BASE, USER_HEAP_SIZE),
        ]
    }

    #[test]
    fn default_layout_is_disjoint() {
        let ranges = ranges();
        for (i, &(base_a, size_a)) in ranges.iter().enumerate() {
            for &(base_b, size_b) in &ranges[i + 1..] {
                let overlap = base_a < base_b + size_b && base_b < base_a + size_a;
                assert!(!overlap, "{base_a:#x} overlaps {base_b:#x}");
            }
        }
    }

    #[test]
    fn default_layout_is_page_aligned() {
        for (base, size) in ranges() {
            assert_eq!(base % PAGE_SIZE, 0);
            assert_eq!(size % PAGE_SIZE, 0);
            assert!(size > 0);
        }
    }

    #[test]
    fn error_codes_are_negative_and_distinct() {
        let codes = [ERR_INVALID_SYSCALL, ERR_NO_MEMORY, ERR_HEAP_BOUNDS];
        for (i, &a) in codes.iter().enumerate() {
            assert!(a < 0);
            for &b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
