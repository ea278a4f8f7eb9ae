//! Local APIC timer driver.
//!
//! The only interrupt source this kernel takes is the LAPIC one-shot timer,
//! so the driver is just the register page at the architectural base plus a
//! PIT-referenced calibration pass.

use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use x86_64::PhysAddr;
use x86_64::instructions::port::Port;

use crate::memory::{self, SegmentAttributes};

/// Timer interrupt vector (same as the legacy PIC timer for compatibility).
pub const TIMER_VECTOR: u8 = 0x20;

/// The architectural Local APIC base address.
const APIC_BASE: u64 = 0xFEE0_0000;

/// Local APIC register offsets.
mod reg {
    pub const ID: u32 = 0x020;
    pub const VERSION: u32 = 0x030;
    pub const EOI: u32 = 0x0B0;
    pub const SPURIOUS: u32 = 0x0F0;
    pub const LVT_TIMER: u32 = 0x320;
    pub const TIMER_INITIAL: u32 = 0x380;
    pub const TIMER_CURRENT: u32 = 0x390;
    pub const TIMER_DIVIDE: u32 = 0x3E0;
}

/// LVT timer mask bit.
const LVT_MASKED: u32 = 1 << 16;

/// Divide configuration for divide-by-16.
const DIVIDE_BY_16: u32 = 0b0011;

/// PIT frequency in Hz (standard PC timer crystal).
const PIT_FREQUENCY: u32 = 1_193_182;

/// Calibration duration in milliseconds.
const CALIBRATION_MS: u32 = 10;

/// Calibrated APIC timer ticks per millisecond.
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

#[inline]
fn read(offset: u32) -> u32 {
    unsafe { core::ptr::read_volatile((APIC_BASE + offset as u64) as *const u32) }
}

#[inline]
fn write(offset: u32, value: u32) {
    unsafe { core::ptr::write_volatile((APIC_BASE + offset as u64) as *mut u32, value) }
}

/// Initialize the Local APIC and calibrate its timer.
pub fn init() {
    // The register page may not be in the firmware's identity mapping.
    memory::map_physical_region(
        memory::current_root(),
        PhysAddr::new(APIC_BASE),
        4096,
        SegmentAttributes::device(),
    );

    // Enable the APIC (bit 8) with spurious vector 0xFF.
    write(reg::SPURIOUS, 0xFF | (1 << 8));

    debug!(
        "Local APIC: ID={}, version={}",
        (read(reg::ID) >> 24) & 0xFF,
        read(reg::VERSION) & 0xFF
    );

    calibrate_timer();
}

/// Send End of Interrupt. Lock-free; safe from interrupt handlers.
#[inline]
pub fn eoi() {
    write(reg::EOI, 0);
}

/// PIT I/O ports.
mod pit {
    pub const CHANNEL0_DATA: u16 = 0x40;
    pub const COMMAND: u16 = 0x43;
}

/// Channel 0, lobyte/hibyte, mode 0 (interrupt on terminal count).
const PIT_ONESHOT_CMD: u8 = 0b00_11_000_0;

/// Wait for approximately `ms` milliseconds using the PIT.
fn pit_wait_ms(ms: u32) {
    let count = ((PIT_FREQUENCY * ms) / 1000).min(0xFFFF) as u16;

    unsafe {
        let mut cmd_port: Port<u8> = Port::new(pit::COMMAND);
        let mut data_port: Port<u8> = Port::new(pit::CHANNEL0_DATA);

        cmd_port.write(PIT_ONESHOT_CMD);
        data_port.write((count & 0xFF) as u8);
        data_port.write((count >> 8) as u8);

        loop {
            // Read-back command: latch count for channel 0.
            cmd_port.write(0b11_10_00_00);
            let low = data_port.read();
            let high = data_port.read();
            let current = (high as u16) << 8 | (low as u16);
            if current == 0 || current > count {
                break;
            }
        }
    }
}

/// Calibrate the APIC timer against the PIT.
fn calibrate_timer() {
    write(reg::TIMER_DIVIDE, DIVIDE_BY_16);
    // Masked during calibration; only the count is read.
    write(reg::LVT_TIMER, TIMER_VECTOR as u32 | LVT_MASKED);
    write(reg::TIMER_INITIAL, 0xFFFF_FFFF);

    pit_wait_ms(CALIBRATION_MS);

    let elapsed = 0xFFFF_FFFF - read(reg::TIMER_CURRENT);
    let ticks_per_ms = elapsed / CALIBRATION_MS;
    TICKS_PER_MS.store(ticks_per_ms, Ordering::SeqCst);

    write(reg::TIMER_INITIAL, 0);

    debug!("APIC timer calibrated: {} ticks/ms", ticks_per_ms);
}

/// Arm a one-shot timer interrupt `ms` milliseconds from now.
pub fn set_timer_oneshot(ms: u32) {
    let ticks = TICKS_PER_MS.load(Ordering::SeqCst) * ms;
    write(reg::TIMER_DIVIDE, DIVIDE_BY_16);
    write(reg::LVT_TIMER, TIMER_VECTOR as u32);
    write(reg::TIMER_INITIAL, ticks.max(1));
}

/// Stop the APIC timer.
pub fn stop_timer() {
    write(reg::LVT_TIMER, TIMER_VECTOR as u32 | LVT_MASKED);
    write(reg::TIMER_INITIAL, 0);
}
