#![no_main]
#![no_std]

extern crate alloc;

use ::uefi::{Status, entry};
use ember_kernel::process::{self, Process};
use ember_kernel::{demo, scheduler, uefi};
use log::info;

#[entry]
fn main() -> Status {
    uefi::init();
    ember_kernel::init();

    info!("ember");

    scheduler::init(Process::root());
    let recovered = process::recover_processes();

    if recovered == 0 {
        // Fresh pool: only the root process exists so far.
        info!("fresh boot, {} process(es)", scheduler::process_count());
        let demo_process =
            Process::create_persistent(demo::payload()).expect("could not create the demo process");
        let code = scheduler::launch_and_wait_until_exit(demo_process);
        info!(
            "demo process exited with code {code} (expected {})",
            demo::EXPECTED_EXIT_CODE
        );
    } else {
        // The records in the arena pick up where the last run stopped.
        info!("resumed {recovered} process(es) from persistent memory");
        scheduler::wait_until_idle();
        info!("all resumed processes have exited");
    }

    info!("nothing left to run, halting");
    ember_kernel::exit_qemu(ember_kernel::QemuExitCode::Success);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use log::error;
    use x86_64::instructions::hlt;

    let file = info.location().map(|l| l.file()).unwrap_or("unknown");
    let line = info.location().map(|l| l.line()).unwrap_or(0);

    error!("PANIC at [{}:{}]:\n{}", file, line, info.message());
    loop {
        hlt();
    }
}
