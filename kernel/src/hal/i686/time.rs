//! Monotonic time from the TSC, calibrated against the PIT.

use core::sync::atomic::{AtomicU64, Ordering};

use raw_cpuid::CpuId;
use x86::io::{inb, outb};
use x86::time::rdtsc;

/// TSC ticks per microsecond.
static TSC_TICKS_PER_US: AtomicU64 = AtomicU64::new(0);

const PIT_CHANNEL2: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
const PIT_GATE: u16 = 0x61;
const PIT_HZ: u64 = 1_193_182;

/// Run PIT channel 2 as a 10 ms one-shot and busy-wait for it.
pub fn pit_wait_10ms() {
    let reload = (PIT_HZ / 100) as u16;
    unsafe {
        let gate = inb(PIT_GATE);
        outb(PIT_GATE, (gate & !0x02) | 0x01);
        outb(PIT_COMMAND, 0b1011_0000); // channel 2, lo/hi, mode 0
        outb(PIT_CHANNEL2, reload as u8);
        outb(PIT_CHANNEL2, (reload >> 8) as u8);
        // Pulse the gate to start counting.
        let gate = inb(PIT_GATE);
        outb(PIT_GATE, gate & !0x01);
        outb(PIT_GATE, gate | 0x01);
        while inb(PIT_GATE) & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}

/// Calibrate the TSC. The kernel requires a TSC; invariance is logged but
/// not enforced, matching the hardware this kernel targets.
pub fn init() {
    let cpuid = CpuId::new();
    let has_tsc = cpuid
        .get_feature_info()
        .map(|f| f.has_tsc())
        .unwrap_or(false);
    if !has_tsc {
        crate::ke::panic::panic(crate::ke::panic::PanicCode::BootFailure);
    }
    let invariant = cpuid
        .get_advanced_power_mgmt_info()
        .map(|info| info.has_invariant_tsc())
        .unwrap_or(false);
    if !invariant {
        log::warn!("TSC is not invariant; timestamps may drift across power states");
    }

    let start = unsafe { rdtsc() };
    pit_wait_10ms();
    let elapsed = unsafe { rdtsc() } - start;
    TSC_TICKS_PER_US.store((elapsed / 10_000).max(1), Ordering::SeqCst);
}

/// Monotonic nanoseconds since calibration.
pub fn timestamp() -> u64 {
    let ticks_per_us = TSC_TICKS_PER_US.load(Ordering::Relaxed).max(1);
    let tsc = unsafe { rdtsc() };
    tsc / ticks_per_us * 1_000 + (tsc % ticks_per_us) * 1_000 / ticks_per_us
}
