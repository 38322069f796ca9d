//! CPU identity and the priority-level register.
//!
//! CPUs are numbered 0..n in MADT discovery order, with the bootstrap
//! processor first. The priority level is mirrored in a per-CPU shadow word
//! so the discipline works before the local APIC is reachable; once it is,
//! the task priority register is kept in sync so the hardware actually
//! defers lower-priority interrupts.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::config::MAX_CPU_COUNT;
use crate::hal::i686::lapic;

static CPU_LAPIC_IDS: [AtomicU8; MAX_CPU_COUNT] = [const { AtomicU8::new(0) }; MAX_CPU_COUNT];
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);
static LAPIC_READY: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
static SHADOW_PRIORITY: [AtomicU8; MAX_CPU_COUNT] = [const { AtomicU8::new(0) }; MAX_CPU_COUNT];

/// Record a CPU found in the MADT. Index 0 is the bootstrap processor.
pub fn register_cpu(index: usize, lapic_id: u8) {
    if index < MAX_CPU_COUNT {
        CPU_LAPIC_IDS[index].store(lapic_id, Ordering::SeqCst);
        if index >= CPU_COUNT.load(Ordering::SeqCst) {
            CPU_COUNT.store(index + 1, Ordering::SeqCst);
        }
    }
}

pub fn mark_lapic_ready() {
    LAPIC_READY.store(true, Ordering::SeqCst);
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst).min(MAX_CPU_COUNT)
}

pub fn lapic_id_of(index: usize) -> u8 {
    CPU_LAPIC_IDS[index].load(Ordering::SeqCst)
}

pub fn current_cpu() -> usize {
    if !LAPIC_READY.load(Ordering::Relaxed) {
        return 0;
    }
    let id = lapic::id() as u8;
    for index in 0..cpu_count() {
        if CPU_LAPIC_IDS[index].load(Ordering::Relaxed) == id {
            return index;
        }
    }
    0
}

pub fn priority_raw() -> u8 {
    SHADOW_PRIORITY[current_cpu()].load(Ordering::Relaxed)
}

pub fn set_priority_raw(level: u8) {
    SHADOW_PRIORITY[current_cpu()].store(level, Ordering::Relaxed);
    if LAPIC_READY.load(Ordering::Relaxed) {
        lapic::set_task_priority(level);
    }
}

pub fn relax() {
    core::hint::spin_loop();
}

/// Wait for the next interrupt with interrupts enabled.
pub fn idle_wait() {
    unsafe {
        core::arch::asm!("sti; hlt", options(nostack, nomem));
    }
}

pub fn halt_forever() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli; hlt", options(nostack, nomem));
        }
    }
}
