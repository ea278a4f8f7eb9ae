//! The per-process persistent record and the checkpoint engine.
//!
//! A record is a signed header followed by two execution-context slots. The
//! `valid_ctx_idx` word names the authoritative snapshot; the other slot is
//! the working copy the process executes in. Promoting the working slot is a
//! single 4-byte store plus its cache-line write-back, so with respect to
//! cache-line durability the commit is atomic: a crash before the write-back
//! leaves the old slot authoritative, a crash after leaves the new one.

use alloc::vec::Vec;
use core::mem::{offset_of, size_of};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::context::{ContextSlot, ExecutionContext};
use crate::device::{PersistentMemory, PersistentMemoryExt};
use crate::pool::PmemPool;
use crate::{PAGE_SIZE, PmemError};

/// Identifies a published process record.
pub const RECORD_SIGNATURE: u64 = 0x656D_6265_7270_6D31;

/// Number of execution-context slots. Doubles as the "uninitialised"
/// sentinel for `valid_ctx_idx`, which is a `u32` so that the commit is a
/// single 4-byte store.
pub const EXECUTION_CONTEXT_COUNT: u32 = 2;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RecordHeader {
    signature: u64,
    valid_ctx_idx: u32,
    _reserved: u32,
}

const VALID_IDX_OFFSET: u64 = offset_of!(RecordHeader, valid_ctx_idx) as u64;
const CTX_ARRAY_OFFSET: u64 = size_of::<RecordHeader>() as u64;
const CTX_SIZE: u64 = size_of::<ExecutionContext>() as u64;

/// Total record footprint; must fit the one page the pool hands out.
pub const RECORD_SIZE: u64 = CTX_ARRAY_OFFSET + 2 * CTX_SIZE;

/// What recovery finds at a registered record address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Signature matches and the validity index names a resumable slot.
    Resumable(usize),
    /// The signature does not match: never published, or not a record.
    NoSignature,
    /// Signature matches but the validity index is out of range.
    Corrupt,
}

/// Handle to a `PersistentProcessInfo` record at a fixed address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    base: u64,
}

impl ProcessRecord {
    /// Pages a record occupies in the pool.
    pub const PAGES: u64 = 1;

    pub const fn at(base: u64) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn slot(&self, index: usize) -> ContextSlot {
        assert!(index < EXECUTION_CONTEXT_COUNT as usize);
        ContextSlot::at(self.base + CTX_ARRAY_OFFSET + index as u64 * CTX_SIZE)
    }

    pub fn signature<P: PersistentMemory>(&self, pmem: &P) -> u64 {
        let header: RecordHeader = pmem.read_record(self.base);
        header.signature
    }

    pub fn raw_valid_index<P: PersistentMemory>(&self, pmem: &P) -> u32 {
        let header: RecordHeader = pmem.read_record(self.base);
        header.valid_ctx_idx
    }

    /// Index of the authoritative slot, or `Uninitialized` when the record
    /// has not been published (or holds garbage).
    pub fn valid_index<P: PersistentMemory>(&self, pmem: &P) -> Result<usize, PmemError> {
        match self.raw_valid_index(pmem) {
            idx @ (0 | 1) => Ok(idx as usize),
            _ => Err(PmemError::Uninitialized),
        }
    }

    /// Index of the slot the process executes in.
    pub fn working_index<P: PersistentMemory>(&self, pmem: &P) -> Result<usize, PmemError> {
        Ok(1 - self.valid_index(pmem)?)
    }

    pub fn valid_slot<P: PersistentMemory>(&self, pmem: &P) -> Result<ContextSlot, PmemError> {
        Ok(self.slot(self.valid_index(pmem)?))
    }

    pub fn working_slot<P: PersistentMemory>(&self, pmem: &P) -> Result<ContextSlot, PmemError> {
        Ok(self.slot(self.working_index(pmem)?))
    }

    /// Begin two-phase initialisation: zero the record and park the validity
    /// index on the sentinel. Until [`publish`](Self::publish) runs, the
    /// record has no signature and recovery ignores it.
    pub fn begin_init<P: PersistentMemory>(pmem: &mut P, base: u64) -> Self {
        assert!(base % PAGE_SIZE == 0, "records are page-aligned");
        pmem.zero_flushed(base, RECORD_SIZE);
        let header = RecordHeader {
            signature: 0,
            valid_ctx_idx: EXECUTION_CONTEXT_COUNT,
            _reserved: 0,
        };
        pmem.persist_record(base, &header);
        Self { base }
    }

    /// Publish a fully populated record: the initial validity index becomes
    /// durable first, the signature last, so recovery can never observe a
    /// signed record with the sentinel still in place.
    pub fn publish<P: PersistentMemory>(&self, pmem: &mut P, valid_index: usize) {
        assert!(valid_index < EXECUTION_CONTEXT_COUNT as usize);
        self.set_valid_index(pmem, valid_index as u32);
        let signature_paddr = self.base + offset_of!(RecordHeader, signature) as u64;
        pmem.persist_record(signature_paddr, &RECORD_SIGNATURE);
    }

    /// Promote the working slot to valid: flush it, commit the validity
    /// index, then re-synchronise the outgoing slot as the next working
    /// copy. `copied` and `flushed` accumulate the bytes copied and cache
    /// lines written back.
    pub fn switch_context<P: PersistentMemory>(
        &self,
        pmem: &mut P,
        copied: &mut u64,
        flushed: &mut u64,
    ) -> Result<(), PmemError> {
        let valid = self.valid_index(pmem)?;
        let working = 1 - valid;

        // 1. Every store of the working slot becomes durable.
        self.slot(working).flush(pmem, flushed);

        // 2. Commit point.
        self.set_valid_index(pmem, working as u32);
        *flushed += 1;

        // 3. The outgoing slot becomes the next working copy, seeded from
        //    the snapshot just committed.
        self.slot(valid)
            .copy_context_from(pmem, self.slot(working), copied);
        Ok(())
    }

    /// Classify the record the way boot-time recovery does.
    pub fn inspect<P: PersistentMemory>(&self, pmem: &P) -> RecordState {
        if self.signature(pmem) != RECORD_SIGNATURE {
            return RecordState::NoSignature;
        }
        match self.raw_valid_index(pmem) {
            idx @ (0 | 1) => RecordState::Resumable(idx as usize),
            _ => RecordState::Corrupt,
        }
    }

    fn set_valid_index<P: PersistentMemory>(&self, pmem: &mut P, index: u32) {
        let paddr = self.base + VALID_IDX_OFFSET;
        pmem.write_record(paddr, &index);
        pmem.flush_line(paddr);
        pmem.fence();
    }
}

/// Walk the pool's record table and return every resumable record with its
/// valid slot index. Records that fail validation are logged, skipped, and
/// left untouched so an operator can inspect them.
pub fn recover_all<P: PersistentMemory>(pool: &PmemPool, pmem: &P) -> Vec<(ProcessRecord, usize)> {
    let mut recovered = Vec::new();
    for (entry, &paddr) in pool.record_table(pmem).iter().enumerate() {
        if paddr == 0 {
            continue;
        }
        let record = ProcessRecord::at(paddr);
        match record.inspect(pmem) {
            RecordState::Resumable(valid) => {
                log::info!("record {entry} at {paddr:#x}: resumable, valid slot {valid}");
                recovered.push((record, valid));
            }
            RecordState::NoSignature => {
                log::warn!("record {entry} at {paddr:#x}: signature mismatch, skipping");
            }
            RecordState::Corrupt => {
                log::warn!(
                    "record {entry} at {paddr:#x}: validity index {} out of range, skipping",
                    record.raw_valid_index(pmem)
                );
            }
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InitialRegisters;
    use crate::segment::SegmentMapping;
    use crate::sim::SimPmem;
    use zerocopy::FromZeros;

    const ARENA_PAGES: u64 = 64;

    /// A published record over a formatted pool: per-slot data/stack pages,
    /// shared code and heap, slot 0 valid.
    fn fixture() -> (SimPmem, PmemPool, ProcessRecord) {
        let mut pmem = SimPmem::new(0, (ARENA_PAGES * PAGE_SIZE) as usize);
        let pool = PmemPool::format(&mut pmem);
        let base = pool.alloc_pages(&mut pmem, ProcessRecord::PAGES).unwrap();
        let record = ProcessRecord::begin_init(&mut pmem, base);

        let code = alloc_segment(&pool, &mut pmem, 0x40_0000);
        let heap = alloc_segment(&pool, &mut pmem, 0x70_0000);
        for index in 0..2 {
            let mut ctx = ExecutionContext::new_zeroed();
            ctx.mapping.code = code;
            ctx.mapping.data = alloc_segment(&pool, &mut pmem, 0x50_0000);
            ctx.mapping.stack = alloc_segment(&pool, &mut pmem, 0x60_0000);
            ctx.mapping.heap = heap;
            record.slot(index).persist(&mut pmem, &ctx);
            record.slot(index).set_registers(
                &mut pmem,
                &InitialRegisters {
                    rip: 0x40_0000,
                    cs: 0x33,
                    rsp: 0x60_1000,
                    ss: 0x2b,
                    cr3: 0x1000_0000 + index as u64 * 0x1000,
                    rflags: 0x200,
                    kernel_rsp: 0xffff_8000,
                },
            );
        }
        record.publish(&mut pmem, 0);
        pool.register_record(&mut pmem, base).unwrap();
        (pmem, pool, record)
    }

    fn alloc_segment(pool: &PmemPool, pmem: &mut SimPmem, vaddr: u64) -> SegmentMapping {
        let mut segment = SegmentMapping::new(vaddr, 0, PAGE_SIZE);
        segment.alloc_from_pool(pool, pmem).unwrap();
        segment
    }

    #[test]
    fn record_fits_in_one_page() {
        assert!(RECORD_SIZE <= PAGE_SIZE);
    }

    #[test]
    fn unpublished_record_is_invisible_and_unswitchable() {
        let mut pmem = SimPmem::new(0, (ARENA_PAGES * PAGE_SIZE) as usize);
        let pool = PmemPool::format(&mut pmem);
        let base = pool.alloc_pages(&mut pmem, 1).unwrap();
        let record = ProcessRecord::begin_init(&mut pmem, base);
        pool.register_record(&mut pmem, base).unwrap();

        assert_eq!(record.inspect(&pmem), RecordState::NoSignature);
        assert_eq!(record.valid_index(&pmem), Err(PmemError::Uninitialized));
        let (mut copied, mut flushed) = (0, 0);
        assert_eq!(
            record.switch_context(&mut pmem, &mut copied, &mut flushed),
            Err(PmemError::Uninitialized)
        );
        assert!(recover_all(&pool, &pmem).is_empty());
    }

    #[test]
    fn switch_promotes_the_working_slot() {
        let (mut pmem, _, record) = fixture();
        assert_eq!(record.valid_index(&pmem), Ok(0));
        assert_eq!(record.working_index(&pmem), Ok(1));

        // The process "ran" in slot 1: registers moved, data changed.
        let working = record.slot(1);
        let mut ctx = working.load(&pmem);
        ctx.cpu.rip = 0x40_0123;
        ctx.cpu.rax = 77;
        working.store(&mut pmem, &ctx);
        pmem.write_bytes(ctx.mapping.data.paddr, &[0x5a; 256]);

        let (mut copied, mut flushed) = (0, 0);
        record.switch_context(&mut pmem, &mut copied, &mut flushed).unwrap();

        assert_eq!(record.valid_index(&pmem), Ok(1));
        assert!(flushed > 0);
        // The new working slot (old slot 0) carries the snapshot.
        let resynced = record.slot(0).load(&pmem);
        assert_eq!(resynced.cpu.rip, 0x40_0123);
        assert_eq!(resynced.cpu.rax, 77);
        let mut data = [0u8; 256];
        pmem.read_bytes(resynced.mapping.data.paddr, &mut data);
        assert_eq!(data, [0x5a; 256]);
        // cr3 stays per-slot.
        assert_eq!(resynced.cpu.cr3, 0x1000_0000);
    }

    #[test]
    fn corrupted_signature_is_skipped_by_recovery() {
        let (mut pmem, pool, record) = fixture();
        pmem.persist_record(record.base(), &0xbad0_bad0_bad0_bad0u64);
        assert_eq!(record.inspect(&pmem), RecordState::NoSignature);
        assert!(recover_all(&pool, &pmem).is_empty());
    }

    #[test]
    fn out_of_range_validity_index_is_corrupt() {
        let (mut pmem, pool, record) = fixture();
        let paddr = record.base() + VALID_IDX_OFFSET;
        pmem.persist_record(paddr, &7u32);
        assert_eq!(record.inspect(&pmem), RecordState::Corrupt);
        assert!(recover_all(&pool, &pmem).is_empty());
        // The record is left untouched for inspection.
        assert_eq!(record.raw_valid_index(&pmem), 7);
    }

    #[test]
    fn recovery_finds_published_records() {
        let (pmem, pool, record) = fixture();
        let recovered = recover_all(&pool, &pmem);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, record);
        assert_eq!(recovered[0].1, 0);
    }

    /// Crash right after the working flush but before the commit write-back:
    /// the previous slot stays authoritative (scenario S6).
    #[test]
    fn crash_between_flush_and_commit_keeps_the_old_slot() {
        let (mut pmem, _, record) = fixture();
        let working = record.slot(1);
        let mut ctx = working.load(&pmem);
        ctx.cpu.rip = 0x40_9999;
        working.store(&mut pmem, &ctx);

        pmem.reset_journal();
        let (mut copied, mut flushed) = (0, 0);
        record.switch_context(&mut pmem, &mut copied, &mut flushed).unwrap();

        // Replay the protocol up to (not including) the first durable write
        // of the commit word.
        let commit_paddr = record.base() + VALID_IDX_OFFSET;
        let mut before_commit = None;
        for k in 0..=pmem.durable_ops() {
            let replayed = pmem.media_after(k);
            if record.raw_valid_index(&replayed) != 0 {
                before_commit = Some(k - 1);
                break;
            }
        }
        let k = before_commit.expect("the protocol must eventually commit");
        let rebooted = pmem.media_after(k);
        assert_eq!(record.inspect(&rebooted), RecordState::Resumable(0));
    }

    /// Commit atomicity: for a crash after any prefix of the protocol's
    /// durable operations, recovery resumes either the old snapshot or the
    /// new one, bit-exactly; never a mixture.
    #[test]
    fn every_crash_point_recovers_a_whole_snapshot() {
        let (mut pmem, _, record) = fixture();

        // Distinguishable old and new states in CPU and data bytes.
        let working = record.slot(1);
        let mut ctx = working.load(&pmem);
        ctx.cpu.rip = 0x40_1111;
        ctx.cpu.r15 = 0x1111;
        working.store(&mut pmem, &ctx);
        pmem.write_bytes(ctx.mapping.data.paddr, &[0x11; 512]);
        let old_valid_ctx = record.slot(0).load(&pmem);

        pmem.reset_journal();
        let (mut copied, mut flushed) = (0, 0);
        record.switch_context(&mut pmem, &mut copied, &mut flushed).unwrap();
        assert!(copied > 0);

        for k in 0..=pmem.durable_ops() {
            let rebooted = pmem.media_after(k);
            match record.inspect(&rebooted) {
                RecordState::Resumable(0) => {
                    // Old world: slot 0 must be byte-identical to the
                    // pre-checkpoint snapshot.
                    let snapshot = record.slot(0).load(&rebooted);
                    assert!(snapshot == old_valid_ctx, "crash at op {k}: old slot mutated");
                }
                RecordState::Resumable(1) => {
                    // New world: slot 1 carries exactly the working state.
                    let snapshot = record.slot(1).load(&rebooted);
                    assert_eq!(snapshot.cpu.rip, 0x40_1111, "crash at op {k}");
                    assert_eq!(snapshot.cpu.r15, 0x1111, "crash at op {k}");
                    let mut data = [0u8; 512];
                    rebooted.read_bytes(snapshot.mapping.data.paddr, &mut data);
                    assert_eq!(data, [0x11; 512], "crash at op {k}");
                }
                state => panic!("crash at op {k}: record unexpectedly {state:?}"),
            }
        }
    }

    /// After the commit point every later crash recovers the new slot.
    #[test]
    fn commit_point_is_monotonic() {
        let (mut pmem, _, record) = fixture();
        pmem.reset_journal();
        let (mut copied, mut flushed) = (0, 0);
        record.switch_context(&mut pmem, &mut copied, &mut flushed).unwrap();

        let mut committed = false;
        for k in 0..=pmem.durable_ops() {
            let rebooted = pmem.media_after(k);
            let now_new = record.raw_valid_index(&rebooted) == 1;
            assert!(!(committed && !now_new), "validity index went backwards at op {k}");
            committed = now_new;
        }
        assert!(committed);
    }
}
