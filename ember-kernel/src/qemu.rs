//! QEMU `isa-debug-exit` support for the test harness and the dev workflow.

use x86_64::instructions::port::Port;

/// I/O port the `isa-debug-exit` device is configured at (iosize=0x04).
const EXIT_PORT: u16 = 0xf4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    unsafe {
        x86_64::instructions::interrupts::disable();
        let mut port: Port<u32> = Port::new(EXIT_PORT);
        port.write(exit_code as u32);
    }
    // Not running under QEMU (or no exit device): halt forever.
    loop {
        x86_64::instructions::hlt();
    }
}
