//! Persistent process state in byte-addressable persistent memory.
//!
//! This crate holds everything about the checkpointing core that is pure
//! bookkeeping over durable bytes: the page pool and its descriptor, the
//! durable record types (segment mappings, execution contexts, the two-slot
//! process record), the checkpoint commit protocol, and boot-time recovery.
//!
//! All of it is written against the [`PersistentMemory`] trait, whose only
//! durability primitive is a cache-line write-back. The kernel implements the
//! trait over real persistent memory with `clflush`; tests implement it with
//! a simulated arena that journals every durable operation so the commit
//! protocol can be crash-tested at every intermediate step.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod context;
pub mod device;
pub mod pool;
pub mod record;
pub mod segment;

#[cfg(test)]
pub(crate) mod sim;

pub use context::{ContextSlot, CpuContext, ExecutionContext, InitialRegisters};
pub use device::{PersistentMemory, PersistentMemoryExt};
pub use pool::{PmemPool, POOL_MAGIC};
pub use record::{
    EXECUTION_CONTEXT_COUNT, ProcessRecord, RECORD_SIGNATURE, RecordState, recover_all,
};
pub use segment::{ProcessMappingInfo, SegmentMapping};

pub const PAGE_SIZE: u64 = 4096;
pub const CACHE_LINE_SIZE: u64 = 64;

/// Errors raised by the persistence core. Failures are values; nothing here
/// unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmemError {
    /// The pool cannot satisfy an allocation request.
    Exhausted,
    /// Operation on a record whose validity index still holds the sentinel.
    Uninitialized,
    /// `expand_heap` would move the watermark past the end of the heap.
    HeapOverflow,
    /// `expand_heap` would move the watermark below the start of the heap.
    HeapUnderflow,
    /// A record carries the signature but an out-of-range validity index.
    CorruptRecord,
}

impl core::fmt::Display for PmemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            PmemError::Exhausted => "persistent memory pool exhausted",
            PmemError::Uninitialized => "process record is not initialized",
            PmemError::HeapOverflow => "heap watermark would exceed the heap segment",
            PmemError::HeapUnderflow => "heap watermark would drop below zero",
            PmemError::CorruptRecord => "process record has an out-of-range validity index",
        };
        f.write_str(message)
    }
}
