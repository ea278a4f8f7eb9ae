//! Durable execution contexts: the CPU register file plus the address-space
//! description a process needs to resume after power loss.

use core::mem::{offset_of, size_of};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::{PersistentMemory, PersistentMemoryExt};
use crate::segment::{self, ProcessMappingInfo};
use crate::PmemError;

/// Bit 1 of RFLAGS is architecturally always set.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

pub const FXSAVE_AREA_SIZE: usize = 512;

/// Full architectural register state, sufficient to resume execution through
/// an interrupt return.
///
/// The GPR block is laid out in the order the kernel's trap entry saves
/// registers; the kernel's restore stub indexes this struct by the offsets
/// below, so the field order is part of the layout contract.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    // Interrupt return frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    /// Root page table of the address space this context resumes into.
    /// Per-slot: never copied between the two slots of a record.
    pub cr3: u64,
    /// FPU/SSE state as stored by FXSAVE64.
    pub fxsave: [u8; FXSAVE_AREA_SIZE],
}

impl CpuContext {
    pub const RSP_OFFSET: usize = offset_of!(CpuContext, rsp);
}

/// Register values needed to initialise a fresh context.
#[derive(Clone, Copy, Debug)]
pub struct InitialRegisters {
    pub rip: u64,
    pub cs: u64,
    pub rsp: u64,
    pub ss: u64,
    pub cr3: u64,
    pub rflags: u64,
    pub kernel_rsp: u64,
}

/// One of the two per-process context slots: CPU state, address-space
/// mappings, the kernel stack pointer, and the heap watermark.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ExecutionContext {
    pub cpu: CpuContext,
    pub mapping: ProcessMappingInfo,
    /// Top of the process's kernel stack. Volatile storage; refreshed at
    /// creation and recovery.
    pub kernel_rsp: u64,
    /// High-water mark of the user heap within the heap segment.
    /// Invariant: `heap_used_size <= mapping.heap.map_size`.
    pub heap_used_size: u64,
}

const CPU_OFFSET: u64 = offset_of!(ExecutionContext, cpu) as u64;
const KERNEL_RSP_OFFSET: u64 = offset_of!(ExecutionContext, kernel_rsp) as u64;
const HEAP_USED_OFFSET: u64 = offset_of!(ExecutionContext, heap_used_size) as u64;

/// Typed view of an [`ExecutionContext`] stored at a fixed address in
/// persistent memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextSlot {
    base: u64,
}

impl ContextSlot {
    pub const fn at(base: u64) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn load<P: PersistentMemory>(&self, pmem: &P) -> ExecutionContext {
        pmem.read_record(self.base)
    }

    /// Store the whole context without making it durable.
    pub fn store<P: PersistentMemory>(&self, pmem: &mut P, ctx: &ExecutionContext) {
        pmem.write_record(self.base, ctx);
    }

    /// Store the whole context and write it back.
    pub fn persist<P: PersistentMemory>(&self, pmem: &mut P, ctx: &ExecutionContext) {
        pmem.persist_record(self.base, ctx);
    }

    pub fn mapping<P: PersistentMemory>(&self, pmem: &P) -> ProcessMappingInfo {
        self.load(pmem).mapping
    }

    /// Initialise the interrupt frame for a first dispatch. Forces the
    /// reserved RFLAGS bit and resets the heap watermark.
    pub fn set_registers<P: PersistentMemory>(&self, pmem: &mut P, regs: &InitialRegisters) {
        let mut ctx = self.load(pmem);
        ctx.cpu.rip = regs.rip;
        ctx.cpu.cs = regs.cs;
        ctx.cpu.rsp = regs.rsp;
        ctx.cpu.ss = regs.ss;
        ctx.cpu.cr3 = regs.cr3;
        ctx.cpu.rflags = regs.rflags | RFLAGS_RESERVED;
        ctx.kernel_rsp = regs.kernel_rsp;
        ctx.heap_used_size = 0;
        self.persist(pmem, &ctx);
    }

    /// Push bytes onto the context's stored user stack, laying out an
    /// initial stack image before first dispatch. Returns the new `rsp`.
    pub fn push_to_stack<P: PersistentMemory>(&self, pmem: &mut P, bytes: &[u8]) -> u64 {
        let ctx = self.load(pmem);
        let stack = ctx.mapping.stack;
        let new_rsp = ctx.cpu.rsp - bytes.len() as u64;
        assert!(
            new_rsp >= stack.vaddr && ctx.cpu.rsp <= stack.vaddr_end(),
            "initial stack image outside the stack segment"
        );
        let paddr = stack.paddr + (new_rsp - stack.vaddr);
        pmem.persist_record(paddr, bytes);
        self.set_rsp(pmem, new_rsp);
        new_rsp
    }

    /// Round the stored `rsp` down to the given power-of-two alignment.
    pub fn align_stack<P: PersistentMemory>(&self, pmem: &mut P, alignment: u64) -> u64 {
        assert!(alignment.is_power_of_two());
        let ctx = self.load(pmem);
        let new_rsp = ctx.cpu.rsp & !(alignment - 1);
        self.set_rsp(pmem, new_rsp);
        new_rsp
    }

    fn set_rsp<P: PersistentMemory>(&self, pmem: &mut P, rsp: u64) {
        let paddr = self.base + CPU_OFFSET + CpuContext::RSP_OFFSET as u64;
        pmem.persist_record(paddr, &rsp);
    }

    /// Move the heap watermark by a signed delta, holding the invariant
    /// `0 <= heap_used_size <= heap.map_size`. On failure the watermark is
    /// unchanged. Returns the new watermark.
    pub fn expand_heap<P: PersistentMemory>(
        &self,
        pmem: &mut P,
        delta: i64,
    ) -> Result<u64, PmemError> {
        let ctx = self.load(pmem);
        let current = ctx.heap_used_size;
        let next = if delta >= 0 {
            let grown = current
                .checked_add(delta as u64)
                .ok_or(PmemError::HeapOverflow)?;
            if grown > ctx.mapping.heap.map_size {
                return Err(PmemError::HeapOverflow);
            }
            grown
        } else {
            let shrink = delta.unsigned_abs();
            if shrink > current {
                return Err(PmemError::HeapUnderflow);
            }
            current - shrink
        };
        pmem.persist_record(self.base + HEAP_USED_OFFSET, &next);
        Ok(next)
    }

    pub fn heap_used_size<P: PersistentMemory>(&self, pmem: &P) -> u64 {
        self.load(pmem).heap_used_size
    }

    /// First virtual address past the in-use heap.
    pub fn heap_end_vaddr<P: PersistentMemory>(&self, pmem: &P) -> u64 {
        let ctx = self.load(pmem);
        ctx.mapping.heap.vaddr + ctx.heap_used_size
    }

    /// Update the root-page-table field. Page tables live in volatile
    /// memory, so this is refreshed whenever they are rebuilt.
    pub fn set_cr3<P: PersistentMemory>(&self, pmem: &mut P, cr3: u64) {
        let paddr = self.base + CPU_OFFSET + offset_of!(CpuContext, cr3) as u64;
        pmem.persist_record(paddr, &cr3);
    }

    pub fn set_kernel_rsp<P: PersistentMemory>(&self, pmem: &mut P, kernel_rsp: u64) {
        pmem.persist_record(self.base + KERNEL_RSP_OFFSET, &kernel_rsp);
    }

    /// Bring this slot in sync with `src`: the CPU context except `cr3`, the
    /// kernel stack pointer, the heap watermark, and the contents of the
    /// data and stack segments. Heap contents are persisted by the user
    /// directly and code is identical between slots, so neither is copied.
    pub fn copy_context_from<P: PersistentMemory>(
        &self,
        pmem: &mut P,
        src: ContextSlot,
        copied: &mut u64,
    ) {
        let from = src.load(pmem);
        let mut to = self.load(pmem);

        let own_cr3 = to.cpu.cr3;
        to.cpu = from.cpu;
        to.cpu.cr3 = own_cr3;
        to.kernel_rsp = from.kernel_rsp;
        to.heap_used_size = from.heap_used_size;
        self.persist(pmem, &to);
        *copied += size_of::<CpuContext>() as u64 + 16;

        segment::copy_segment_data(pmem, &to.mapping.data, &from.mapping.data, copied);
        segment::copy_segment_data(pmem, &to.mapping.stack, &from.mapping.stack, copied);
    }

    /// Write back every segment and the record bytes themselves, so that
    /// everything this context can name is durable.
    pub fn flush<P: PersistentMemory>(&self, pmem: &mut P, flushes: &mut u64) {
        let ctx = self.load(pmem);
        for seg in ctx.mapping.segments() {
            segment::flush_segment(pmem, seg, flushes);
        }
        *flushes += pmem.flush_range(self.base, size_of::<ExecutionContext>() as u64);
        pmem.fence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentMapping;
    use crate::sim::SimPmem;
    use crate::PAGE_SIZE;
    use proptest::prelude::*;
    use std::vec;
    use std::vec::Vec;
    use zerocopy::FromZeros;

    const SLOT_A: u64 = 0x1000;
    const SLOT_B: u64 = 0x2000;

    /// A pair of context slots over a simulated arena. Data and stack pages
    /// are distinct per slot; heap and code are shared.
    fn fixture() -> (SimPmem, ContextSlot, ContextSlot) {
        let mut pmem = SimPmem::new(0, 64 * PAGE_SIZE as usize);
        let a = ContextSlot::at(SLOT_A);
        let b = ContextSlot::at(SLOT_B);
        for (slot, data_page, stack_page) in [(a, 16, 17), (b, 18, 19)] {
            let mut ctx = ExecutionContext::new_zeroed();
            ctx.mapping.code = SegmentMapping::new(0x40_0000, 8 * PAGE_SIZE, PAGE_SIZE);
            ctx.mapping.data = SegmentMapping::new(0x50_0000, data_page * PAGE_SIZE, PAGE_SIZE);
            ctx.mapping.stack = SegmentMapping::new(0x60_0000, stack_page * PAGE_SIZE, PAGE_SIZE);
            ctx.mapping.heap = SegmentMapping::new(0x70_0000, 9 * PAGE_SIZE, PAGE_SIZE);
            slot.persist(&mut pmem, &ctx);
        }
        (pmem, a, b)
    }

    #[test]
    fn set_registers_forces_reserved_flag_and_resets_heap() {
        let (mut pmem, slot, _) = fixture();
        slot.expand_heap(&mut pmem, 64).unwrap();
        slot.set_registers(
            &mut pmem,
            &InitialRegisters {
                rip: 0x40_0000,
                cs: 0x33,
                rsp: 0x60_1000,
                ss: 0x2b,
                cr3: 0xdead_b000,
                rflags: 0x200,
                kernel_rsp: 0xffff_8000,
            },
        );
        let ctx = slot.load(&pmem);
        assert_eq!(ctx.cpu.rflags, 0x202);
        assert_eq!(ctx.heap_used_size, 0);
        assert_eq!(ctx.cpu.cr3, 0xdead_b000);
    }

    #[test]
    fn stack_push_and_align() {
        let (mut pmem, slot, _) = fixture();
        slot.set_registers(
            &mut pmem,
            &InitialRegisters {
                rip: 0,
                cs: 0,
                rsp: 0x60_1000,
                ss: 0,
                cr3: 0,
                rflags: 0,
                kernel_rsp: 0,
            },
        );
        let rsp = slot.push_to_stack(&mut pmem, b"hello");
        assert_eq!(rsp, 0x60_1000 - 5);
        let rsp = slot.align_stack(&mut pmem, 16);
        assert_eq!(rsp % 16, 0);
        assert_eq!(slot.load(&pmem).cpu.rsp, rsp);

        // The pushed bytes landed at the top of the stack's physical range.
        let stack = slot.mapping(&pmem).stack;
        let mut buf = [0u8; 5];
        pmem.read_bytes(stack.paddr + stack.map_size - 5, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn heap_bounds_at_the_boundary() {
        let (mut pmem, slot, _) = fixture();
        assert_eq!(slot.expand_heap(&mut pmem, PAGE_SIZE as i64), Ok(PAGE_SIZE));
        assert_eq!(slot.heap_end_vaddr(&pmem), 0x70_0000 + PAGE_SIZE);

        // One byte past the segment fails and leaves the watermark alone.
        assert_eq!(slot.expand_heap(&mut pmem, 1), Err(PmemError::HeapOverflow));
        assert_eq!(slot.heap_used_size(&pmem), PAGE_SIZE);

        assert_eq!(slot.expand_heap(&mut pmem, -(PAGE_SIZE as i64)), Ok(0));
        assert_eq!(slot.expand_heap(&mut pmem, -1), Err(PmemError::HeapUnderflow));
        assert_eq!(slot.heap_used_size(&pmem), 0);
    }

    proptest! {
        /// The final watermark equals the running sum iff no prefix ever
        /// leaves the heap bounds; the first violating call fails and leaves
        /// the watermark unchanged.
        #[test]
        fn heap_watermark_matches_the_running_sum(deltas in proptest::collection::vec(-6000i64..6000, 1..24)) {
            let (mut pmem, slot, _) = fixture();
            let limit = PAGE_SIZE as i64;
            let mut expected = 0i64;
            for &delta in &deltas {
                let attempted = expected + delta;
                let result = slot.expand_heap(&mut pmem, delta);
                if attempted < 0 {
                    prop_assert_eq!(result, Err(PmemError::HeapUnderflow));
                } else if attempted > limit {
                    prop_assert_eq!(result, Err(PmemError::HeapOverflow));
                } else {
                    prop_assert_eq!(result, Ok(attempted as u64));
                    expected = attempted;
                }
                prop_assert_eq!(slot.heap_used_size(&pmem), expected as u64);
            }
        }

        /// copy(a -> b) then copy(b -> a') round-trips bit-exactly: data and
        /// stack contents match, and the CPU registers match except cr3.
        #[test]
        fn context_copy_round_trips(
            seed in proptest::collection::vec(proptest::num::u8::ANY, 32),
            rip in proptest::num::u64::ANY,
            rax in proptest::num::u64::ANY,
        ) {
            let (mut pmem, a, b) = fixture();

            let mut ctx = a.load(&pmem);
            ctx.cpu.rip = rip;
            ctx.cpu.rax = rax;
            ctx.cpu.cr3 = 0xaaa000;
            ctx.cpu.fxsave[0] = seed[0];
            ctx.heap_used_size = 128;
            a.persist(&mut pmem, &ctx);
            let mut ctx_b = b.load(&pmem);
            ctx_b.cpu.cr3 = 0xbbb000;
            b.persist(&mut pmem, &ctx_b);

            // Seed slot A's data and stack pages with patterned bytes.
            let mapping_a = a.mapping(&pmem);
            let mut image = Vec::new();
            for i in 0..PAGE_SIZE as usize {
                image.push(seed[i % seed.len()].wrapping_add(i as u8));
            }
            pmem.write_bytes(mapping_a.data.paddr, &image);
            pmem.write_bytes(mapping_a.stack.paddr, &image);

            let mut copied = 0;
            b.copy_context_from(&mut pmem, a, &mut copied);
            a.copy_context_from(&mut pmem, b, &mut copied);

            let round_tripped = a.load(&pmem);
            prop_assert_eq!(round_tripped.cpu.rip, rip);
            prop_assert_eq!(round_tripped.cpu.rax, rax);
            prop_assert_eq!(round_tripped.cpu.cr3, 0xaaa000, "cr3 stays per-slot");
            prop_assert_eq!(b.load(&pmem).cpu.cr3, 0xbbb000);
            prop_assert_eq!(round_tripped.heap_used_size, 128);

            let mut data = vec![0u8; PAGE_SIZE as usize];
            pmem.read_bytes(round_tripped.mapping.data.paddr, &mut data);
            prop_assert_eq!(&data, &image);
            let mut stack = vec![0u8; PAGE_SIZE as usize];
            pmem.read_bytes(round_tripped.mapping.stack.paddr, &mut stack);
            prop_assert_eq!(&stack, &image);
        }
    }

    #[test]
    fn flush_covers_segments_and_record() {
        let (mut pmem, slot, _) = fixture();
        let mut flushes = 0;
        slot.flush(&mut pmem, &mut flushes);
        let lines_per_page = PAGE_SIZE / 64;
        let record_lines = (size_of::<ExecutionContext>() as u64).div_ceil(64);
        assert_eq!(flushes, 4 * lines_per_page + record_lines);
    }
}
