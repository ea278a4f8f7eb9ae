//! Process management.
//!
//! A process is a volatile handle around a durable `ProcessRecord`: the
//! record owns everything that must survive power loss, the handle owns the
//! volatile pieces (kernel stack, saved kernel context, scheduling state).
//! The root process is the boot thread itself and has no record.

pub mod dispatch;
pub mod kcontext;
pub mod state;

pub use kcontext::{KernelContext, switch_kernel_context};
pub use state::{InterruptFrame, SavedGprs};

use core::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use pmem::{
    ExecutionContext, InitialRegisters, PersistentMemoryExt, PmemError, ProcessMappingInfo,
    ProcessRecord, SegmentMapping,
};
use x86_64::registers::rflags::RFlags;
use x86_64::{PhysAddr, VirtAddr};
use zerocopy::FromZeros;

use crate::memory::{self, SegmentAttributes, paging};
use crate::{gdt, persist, scheduler};

use ember_abi as abi;

pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new() -> Self {
        static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(0);
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotInitialized,
    Ready,
    Running,
    Sleeping,
    Killed,
}

/// Owned kernel stack with RAII cleanup.
struct KernelStack {
    base: VirtAddr,
    size: usize,
}

impl KernelStack {
    fn new(size: usize) -> Self {
        Self {
            base: memory::allocate_kernel_stack(size),
            size,
        }
    }

    fn top(&self) -> VirtAddr {
        self.base + self.size as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe {
            memory::free_kernel_stack(self.base, self.size);
        }
    }
}

/// A schedulable process.
pub struct Process {
    id: ProcessId,
    status: ProcessStatus,
    /// Durable record; `None` for the root (pure kernel) process.
    record: Option<ProcessRecord>,
    /// Kernel stack; the root process runs on the boot stack instead.
    #[allow(dead_code)]
    kernel_stack: Option<KernelStack>,
    /// Saved kernel execution point while the process is switched out.
    pub(crate) kcontext: KernelContext,
}

impl Process {
    /// The boot thread as a process: seeds the scheduler so the current
    /// process pointer is never null.
    pub fn root() -> Self {
        Self {
            id: ProcessId::new(),
            status: ProcessStatus::Running,
            record: None,
            kernel_stack: None,
            kcontext: KernelContext::default(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ProcessStatus) {
        self.status = status;
    }

    pub fn record(&self) -> Option<ProcessRecord> {
        self.record
    }

    pub fn is_persistent(&self) -> bool {
        self.record.is_some()
    }

    /// Create a persistent process from a flat code image entered at its
    /// first byte.
    ///
    /// Code and heap pages are shared between the two context slots; data
    /// and stack pages are per-slot so the commit protocol can
    /// double-buffer them. The record is populated under the sentinel and
    /// published only once both slots are complete.
    pub fn create_persistent(code_image: &[u8]) -> Result<Self, PmemError> {
        assert!(
            code_image.len() as u64 <= abi::USER_CODE_SIZE,
            "code image does not fit the code segment"
        );

        let kernel_stack = KernelStack::new(KERNEL_STACK_SIZE);
        let kernel_rsp = kernel_stack.top();

        let record = persist::with(|pmem, pool| -> Result<ProcessRecord, PmemError> {
            let base = pool.alloc_pages(pmem, ProcessRecord::PAGES)?;
            let record = ProcessRecord::begin_init(pmem, base);

            let mut code = SegmentMapping::new(abi::USER_CODE_BASE, 0, abi::USER_CODE_SIZE);
            code.alloc_from_pool(pool, pmem)?;
            pmem.zero_flushed(code.paddr, code.map_size);
            pmem.persist_record(code.paddr, code_image);

            let mut heap = SegmentMapping::new(abi::USER_HEAP_BASE, 0, abi::USER_HEAP_SIZE);
            heap.alloc_from_pool(pool, pmem)?;
            pmem.zero_flushed(heap.paddr, heap.map_size);

            for index in 0..2 {
                let mut data = SegmentMapping::new(abi::USER_DATA_BASE, 0, abi::USER_DATA_SIZE);
                data.alloc_from_pool(pool, pmem)?;
                pmem.zero_flushed(data.paddr, data.map_size);

                let mut stack = SegmentMapping::new(abi::USER_STACK_BASE, 0, abi::USER_STACK_SIZE);
                stack.alloc_from_pool(pool, pmem)?;
                pmem.zero_flushed(stack.paddr, stack.map_size);

                let mut ctx = ExecutionContext::new_zeroed();
                ctx.mapping = ProcessMappingInfo {
                    code,
                    data,
                    stack,
                    heap,
                };
                assert!(ctx.mapping.ranges_disjoint());

                let slot = record.slot(index);
                slot.persist(pmem, &ctx);

                let root = build_address_space(&ctx.mapping);
                slot.set_registers(
                    pmem,
                    &InitialRegisters {
                        rip: abi::USER_CODE_BASE,
                        cs: gdt::user_code_selector() as u64,
                        rsp: abi::USER_STACK_TOP,
                        ss: gdt::user_data_selector() as u64,
                        cr3: root.as_u64(),
                        rflags: RFlags::INTERRUPT_FLAG.bits(),
                        kernel_rsp: kernel_rsp.as_u64(),
                    },
                );
                slot.align_stack(pmem, 16);
            }

            record.publish(pmem, 0);
            pool.register_record(pmem, base)?;
            Ok(record)
        })?;

        let kcontext = kcontext::seed_kernel_stack(kernel_rsp, dispatch::user_entry_trampoline);
        Ok(Self {
            id: ProcessId::new(),
            status: ProcessStatus::Ready,
            record: Some(record),
            kernel_stack: Some(kernel_stack),
            kcontext,
        })
    }

    /// Wrap a resumable record into a runnable process: rebuild both slots'
    /// address spaces, refresh the volatile fields, and re-synchronise the
    /// working slot from the committed snapshot. The first switch into the
    /// process returns through its saved interrupt frame.
    pub fn recover(record: ProcessRecord, valid_index: usize) -> Self {
        let kernel_stack = KernelStack::new(KERNEL_STACK_SIZE);
        let kernel_rsp = kernel_stack.top();

        persist::with(|pmem, _| {
            for index in 0..2 {
                let slot = record.slot(index);
                let root = build_address_space(&slot.mapping(pmem));
                slot.set_cr3(pmem, root.as_u64());
            }
            let valid_slot = record.slot(valid_index);
            valid_slot.set_kernel_rsp(pmem, kernel_rsp.as_u64());

            let mut copied = 0;
            record
                .slot(1 - valid_index)
                .copy_context_from(pmem, valid_slot, &mut copied);
            debug!(
                "recovered record {:#x}: re-synchronised {} bytes into the working slot",
                record.base(),
                copied
            );
        });

        let kcontext = kcontext::seed_kernel_stack(kernel_rsp, dispatch::user_entry_trampoline);
        Self {
            id: ProcessId::new(),
            status: ProcessStatus::Ready,
            record: Some(record),
            kernel_stack: Some(kernel_stack),
            kcontext,
        }
    }

    /// Root page table and kernel stack top of the working slot, for the
    /// scheduler to install at switch-in. `None` for the root process.
    pub fn dispatch_params(&self) -> Option<(u64, u64)> {
        let record = self.record?;
        Some(persist::with(|pmem, _| {
            let slot = record
                .working_slot(pmem)
                .expect("scheduled record is published");
            let ctx = slot.load(pmem);
            (ctx.cpu.cr3, ctx.kernel_rsp)
        }))
    }

    /// Capture the interrupted user state into the working slot. The bytes
    /// become durable in the checkpoint that follows.
    pub fn snapshot_user_state(&self, gprs: &SavedGprs, frame: &InterruptFrame) {
        let Some(record) = self.record else {
            return;
        };
        persist::with(|pmem, _| {
            let slot = record
                .working_slot(pmem)
                .expect("scheduled record is published");
            let mut ctx = slot.load(pmem);
            let cr3 = ctx.cpu.cr3;
            ctx.cpu = state::capture_cpu_context(gprs, frame, cr3);
            slot.store(pmem, &ctx);
        });
    }

    /// Run the checkpoint engine: promote the working slot to valid.
    pub fn checkpoint(&self) {
        let Some(record) = self.record else {
            return;
        };
        let (copied, flushed) = persist::with(|pmem, _| {
            let mut copied = 0;
            let mut flushed = 0;
            record
                .switch_context(pmem, &mut copied, &mut flushed)
                .expect("scheduled record is published");
            (copied, flushed)
        });
        debug!(
            "checkpoint {:?}: {} bytes copied, {} lines flushed",
            self.id, copied, flushed
        );
    }

    /// Move the heap watermark of the working slot; returns the new end of
    /// the heap.
    pub fn expand_heap(&self, delta: i64) -> Result<u64, PmemError> {
        let record = self.record.ok_or(PmemError::Uninitialized)?;
        persist::with(|pmem, _| {
            let slot = record.working_slot(pmem)?;
            slot.expand_heap(pmem, delta)?;
            Ok(slot.heap_end_vaddr(pmem))
        })
    }
}

/// Build a root page table mapping the four segments of one context slot.
fn build_address_space(mapping: &ProcessMappingInfo) -> PhysAddr {
    let root = paging::create_process_root();
    paging::map_segment(root, &mapping.code, SegmentAttributes::user_code(), false);
    paging::map_segment(root, &mapping.data, SegmentAttributes::user_data(), false);
    paging::map_segment(root, &mapping.stack, SegmentAttributes::user_data(), false);
    paging::map_segment(root, &mapping.heap, SegmentAttributes::user_data(), false);
    root
}

/// Recover every resumable record from the pool and register the resulting
/// processes. Returns how many processes were recovered.
pub fn recover_processes() -> usize {
    let records = persist::with(|pmem, pool| pmem::recover_all(pool, pmem));
    let count = records.len();
    for (record, valid_index) in records {
        let process = Process::recover(record, valid_index);
        // Queue-full is fatal at registration time.
        scheduler::register_process(process).expect("run queue full during recovery");
    }
    count
}
