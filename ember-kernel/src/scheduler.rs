//! Round-robin process scheduler.
//!
//! A timer tick (or an explicit yield) suspends the current process on its
//! kernel stack; if that process is persistent, its user state is captured
//! into the working slot and the checkpoint engine runs *before* the switch,
//! so what the next dispatch observes is exactly what the commit made
//! durable. Selection is strict round-robin over Ready/Running processes,
//! ties broken by insertion order.

use alloc::vec::Vec;

use log::{debug, info};
use pmem::PmemError;
use run_queue::{QueueFull, RunQueue};
use spinning_top::RwSpinlock;
use x86_64::{PhysAddr, VirtAddr};

use crate::process::{
    InterruptFrame, KernelContext, Process, ProcessId, ProcessStatus, SavedGprs,
    switch_kernel_context,
};
use crate::{apic, gdt, memory};

static SCHEDULER: RwSpinlock<Option<Scheduler>> = RwSpinlock::new(None);

/// Time slice in milliseconds.
pub const TIME_SLICE_MS: u32 = 20;

struct Scheduler {
    queue: RunQueue<Process>,
    /// Slot of the process currently on the CPU. Never empty after init().
    current: usize,
    /// Boot root page table, installed when the root process runs.
    kernel_root: u64,
    /// Exit codes of processes that have been killed.
    finished: Vec<(ProcessId, i64)>,
    /// The most recently killed process. Held until the next death so that
    /// the kernel stack we exited on is never freed while in use.
    graveyard: Option<Process>,
}

impl Scheduler {
    fn new(root: Process) -> Self {
        let mut queue = RunQueue::with_default_capacity();
        let slot = queue.insert(root).expect("a fresh queue accepts the root");
        queue.set_cursor(slot);
        Self {
            queue,
            current: slot,
            kernel_root: memory::current_root().as_u64(),
            finished: Vec::new(),
            graveyard: None,
        }
    }

    fn runnable(process: &Process) -> bool {
        matches!(
            process.status(),
            ProcessStatus::Ready | ProcessStatus::Running
        )
    }
}

/// Everything a context switch needs once the lock is dropped.
struct SwitchPlan {
    save: *mut KernelContext,
    load: *const KernelContext,
    cr3: u64,
    kernel_rsp: u64,
}

/// Generates a naked entry stub for a preemptable trap vector.
///
/// Saves all general-purpose registers, hands the handler pointers to the
/// saved GPRs and the CPU-pushed interrupt frame, and restores everything
/// with `iretq` when (if) the handler returns.
macro_rules! trap_entry {
    ($handler:ident) => {{
        #[unsafe(naked)]
        extern "C" fn entry() {
            core::arch::naked_asm!(
                // Save all GPRs (reverse order so SavedGprs matches).
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                // rdi = saved GPRs, rsi = interrupt frame (15 regs above it).
                "mov rdi, rsp",
                "lea rsi, [rsp + 120]",
                "call {handler}",
                // Resume the interrupted context.
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rbp",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rbx",
                "pop rax",
                "iretq",
                handler = sym $handler,
            )
        }
        entry
    }};
}

pub(crate) use trap_entry;

/// Install the scheduler with its root process and arm the first time
/// slice. The root process represents the boot thread; the current process
/// is never null from here on.
pub fn init(root: Process) {
    let entry = trap_entry!(timer_interrupt_handler);
    crate::interrupts::set_raw_handler(apic::TIMER_VECTOR, entry as usize as u64);

    let mut scheduler = SCHEDULER.write();
    assert!(scheduler.is_none(), "scheduler already initialized");
    *scheduler = Some(Scheduler::new(root));
    drop(scheduler);

    debug!("scheduler online, {TIME_SLICE_MS}ms time slice");
    apic::set_timer_oneshot(TIME_SLICE_MS);
}

/// Acquire the scheduler with interrupts disabled so the timer can never
/// observe the lock held.
///
/// The `expect` guards against use before `init()`, a boot-order invariant.
fn with_scheduler_mut<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let were_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();

    let result = {
        let mut guard = SCHEDULER.write();
        let scheduler = guard
            .as_mut()
            .expect("Scheduler has not been initialized");
        f(scheduler)
    };

    if were_enabled {
        x86_64::instructions::interrupts::enable();
    }
    result
}

/// Add a process to the run queue, marking it Ready.
/// A full queue is fatal at registration time; callers decide how.
pub fn register_process(mut process: Process) -> Result<ProcessId, QueueFull> {
    process.set_status(ProcessStatus::Ready);
    let id = process.id();
    with_scheduler_mut(|scheduler| scheduler.queue.insert(process))?;
    Ok(id)
}

pub fn process_count() -> usize {
    with_scheduler_mut(|scheduler| scheduler.queue.len())
}

pub fn current_process_id() -> ProcessId {
    with_current_process(|process| process.id())
}

/// Execute a closure with mutable access to the current process.
///
/// The inner `expect` is a kernel invariant: `current` always names an
/// occupied slot (the dying process is moved out only after a replacement
/// has been selected).
pub fn with_current_process<F, R>(f: F) -> R
where
    F: FnOnce(&mut Process) -> R,
{
    with_scheduler_mut(|scheduler| {
        let current = scheduler.current;
        let process = scheduler
            .queue
            .get_mut(current)
            .expect("current process not found");
        f(process)
    })
}

/// Select the next runnable process and switch onto its kernel context.
/// Returns (much later) when the suspended process is scheduled again, or
/// immediately when there is nothing to switch to.
///
/// # Safety
/// Interrupts must be disabled. The caller must be running on the current
/// process's kernel stack (trap handler or the root's boot thread).
unsafe fn rotate() {
    let plan = with_scheduler_mut(|scheduler| {
        let next = scheduler.queue.select_next(Scheduler::runnable)?;
        if next == scheduler.current {
            return None;
        }

        let previous = scheduler.current;
        if let Some(outgoing) = scheduler.queue.get_mut(previous) {
            if outgoing.status() == ProcessStatus::Running {
                outgoing.set_status(ProcessStatus::Ready);
            }
        }

        scheduler.current = next;
        let kernel_root = scheduler.kernel_root;
        let incoming = scheduler
            .queue
            .get_mut(next)
            .expect("selected slot is occupied");
        incoming.set_status(ProcessStatus::Running);
        let (cr3, kernel_rsp) = incoming.dispatch_params().unwrap_or((kernel_root, 0));
        let load = &raw const incoming.kcontext;

        // The suspended context is saved into the outgoing process, or into
        // the graveyard corpse when the outgoing process just exited.
        let save = match scheduler.queue.get_mut(previous) {
            Some(outgoing) => &raw mut outgoing.kcontext,
            None => {
                let corpse = scheduler
                    .graveyard
                    .as_mut()
                    .expect("an exited process parks in the graveyard");
                &raw mut corpse.kcontext
            }
        };
        Some(SwitchPlan {
            save,
            load,
            cr3,
            kernel_rsp,
        })
    });

    let Some(plan) = plan else {
        return;
    };

    // Install the incoming address space and ring-transition stack before
    // touching its kernel stack.
    if plan.kernel_rsp != 0 {
        gdt::set_privilege_stack(VirtAddr::new(plan.kernel_rsp));
    }
    unsafe {
        memory::switch_root(PhysAddr::new(plan.cr3));
        switch_kernel_context(plan.save, plan.load);
    }
}

/// Checkpoint the current process if it is persistent: capture the
/// interrupted user state into the working slot, then run the commit
/// protocol. Must happen before the address space is switched away.
///
/// The commit swaps the slot roles, so the process must continue on the
/// *new* working slot's pages (just re-synchronised from the snapshot) even
/// when no process switch follows; its address space is reloaded here.
fn checkpoint_current(gprs: &SavedGprs, frame: &InterruptFrame) {
    with_current_process(|process| {
        process.snapshot_user_state(gprs, frame);
        process.checkpoint();
        if let Some((cr3, _)) = process.dispatch_params() {
            unsafe {
                memory::switch_root(PhysAddr::new(cr3));
            }
        }
    });
}

/// Timer tick: checkpoint the interrupted process (when it was executing
/// user code), rotate, and re-arm the timer.
extern "sysv64" fn timer_interrupt_handler(gprs: *mut SavedGprs, frame: *const InterruptFrame) {
    apic::eoi();

    let frame_ref = unsafe { &*frame };
    if frame_ref.cs == gdt::user_code_selector() as u64 {
        let gprs_ref = unsafe { &*gprs };
        checkpoint_current(gprs_ref, frame_ref);
    }

    unsafe {
        rotate();
    }
    // Back on this process's time: start its slice.
    apic::set_timer_oneshot(TIME_SLICE_MS);
}

/// Voluntary yield from a trap handler (the `yield` syscall). The caller
/// has already placed the syscall's return value in the saved GPRs.
///
/// # Safety
/// Must be called from a trap handler with interrupts disabled.
pub unsafe fn yield_from_trap(gprs: *const SavedGprs, frame: *const InterruptFrame) {
    let gprs_ref = unsafe { &*gprs };
    let frame_ref = unsafe { &*frame };
    checkpoint_current(gprs_ref, frame_ref);
    unsafe {
        rotate();
    }
}

/// Kill the current process and switch away for good.
///
/// # Safety
/// Must be called from a trap handler on the dying process's kernel stack.
pub unsafe fn exit_current(code: i64) -> ! {
    let plan = with_scheduler_mut(|scheduler| {
        let slot = scheduler.current;
        let mut corpse = scheduler
            .queue
            .remove(slot)
            .expect("current process not found");
        corpse.set_status(ProcessStatus::Killed);
        scheduler.finished.push((corpse.id(), code));
        debug!("process {:?} exited with code {code}", corpse.id());

        // Anything waiting on an exit gets another look.
        for (_, process) in scheduler.queue.iter_mut() {
            if process.status() == ProcessStatus::Sleeping {
                process.set_status(ProcessStatus::Ready);
            }
        }

        // Park the corpse; its kernel stack (which we are standing on) must
        // outlive the switch below. The previous corpse is freed here.
        scheduler.graveyard = Some(corpse);
        let save = &raw mut scheduler.graveyard.as_mut().unwrap().kcontext;

        let next = scheduler
            .queue
            .select_next(Scheduler::runnable)
            .expect("no runnable process left after exit");
        scheduler.current = next;
        let kernel_root = scheduler.kernel_root;
        let incoming = scheduler
            .queue
            .get_mut(next)
            .expect("selected slot is occupied");
        incoming.set_status(ProcessStatus::Running);
        let (cr3, kernel_rsp) = incoming.dispatch_params().unwrap_or((kernel_root, 0));
        let load = &raw const incoming.kcontext;
        SwitchPlan {
            save,
            load,
            cr3,
            kernel_rsp,
        }
    });

    if plan.kernel_rsp != 0 {
        gdt::set_privilege_stack(VirtAddr::new(plan.kernel_rsp));
    }
    unsafe {
        memory::switch_root(PhysAddr::new(plan.cr3));
        switch_kernel_context(plan.save, plan.load);
    }
    unreachable!("killed process was scheduled again");
}

/// Move the current process's heap watermark; returns the new heap end.
pub fn expand_current_heap(delta: i64) -> Result<u64, PmemError> {
    with_current_process(|process| process.expand_heap(delta))
}

fn take_exit_code(id: ProcessId) -> Option<i64> {
    with_scheduler_mut(|scheduler| {
        let index = scheduler
            .finished
            .iter()
            .position(|(finished_id, _)| *finished_id == id)?;
        Some(scheduler.finished.swap_remove(index).1)
    })
}

/// Register `process`, then sleep the calling (root) process until it has
/// exited. Returns its exit code.
pub fn launch_and_wait_until_exit(process: Process) -> i64 {
    // Queue-full is fatal at registration time.
    let id = register_process(process).expect("run queue full");
    info!("launched process {id:?}, waiting for exit");

    with_current_process(|root| root.set_status(ProcessStatus::Sleeping));
    x86_64::instructions::interrupts::disable();
    loop {
        if let Some(code) = take_exit_code(id) {
            with_current_process(|root| root.set_status(ProcessStatus::Running));
            x86_64::instructions::interrupts::enable();
            return code;
        }
        // Sleep until the timer rotates us back in.
        x86_64::instructions::interrupts::enable_and_hlt();
        x86_64::instructions::interrupts::disable();
    }
}

/// Sleep the calling (root) process until every other process has exited.
pub fn wait_until_idle() {
    with_current_process(|root| root.set_status(ProcessStatus::Sleeping));
    x86_64::instructions::interrupts::disable();
    loop {
        if process_count() == 1 {
            with_current_process(|root| root.set_status(ProcessStatus::Running));
            x86_64::instructions::interrupts::enable();
            return;
        }
        x86_64::instructions::interrupts::enable_and_hlt();
        x86_64::instructions::interrupts::disable();
    }
}
