//! Local APIC: priority register, EOI, IPIs and the one-shot system timer.
//!
//! Memory-mapped xAPIC access; the register window is mapped into the
//! dynamic region at bring-up.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use x86::msr::{rdmsr, wrmsr, IA32_APIC_BASE};

use crate::hal::i686::time;
use crate::mm::{dynmap, PageFlags};
use crate::status::{Result, Status};

const REG_ID: usize = 0x020;
const REG_TPR: usize = 0x080;
const REG_PPR: usize = 0x0A0;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const SPURIOUS_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u32 = 0xFF;
const LVT_MASKED: u32 = 1 << 16;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const TIMER_DIVIDE_BY_16: u32 = 0b0011;

/// Mapped register window, shared by every CPU (the window is per-CPU
/// banked by the hardware).
static LAPIC_BASE: AtomicUsize = AtomicUsize::new(0);
/// Timer ticks per millisecond, measured against the PIT once.
static TIMER_TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy)]
pub enum IpiShorthand {
    None(u8),
    AllExcludingSelf,
}

fn register(offset: usize) -> *mut u32 {
    (LAPIC_BASE.load(Ordering::Relaxed) + offset) as *mut u32
}

fn read(offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile(register(offset)) }
}

fn write(offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile(register(offset), value) };
}

/// Map the register window and enable the local APIC of the calling CPU.
pub fn init(timer_vector: u8) -> Result {
    if LAPIC_BASE.load(Ordering::SeqCst) == 0 {
        let physical = unsafe { rdmsr(IA32_APIC_BASE) } as usize & 0xFFFF_F000;
        let window = dynmap::map_dynamic(
            physical,
            0x1000,
            PageFlags::WRITABLE | PageFlags::CACHE_DISABLE,
        )?;
        LAPIC_BASE.store(window, Ordering::SeqCst);
    }

    unsafe {
        // Global enable bit in the MSR, per-CPU.
        let base = rdmsr(IA32_APIC_BASE);
        wrmsr(IA32_APIC_BASE, base | (1 << 11));
    }

    write(REG_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_VECTOR);
    write(REG_TPR, 0);
    write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write(REG_LVT_TIMER, LVT_MASKED | timer_vector as u32);

    if TIMER_TICKS_PER_MS.load(Ordering::SeqCst) == 0 {
        calibrate_timer();
    }
    Ok(())
}

/// Measure the timer frequency against a 10 ms PIT one-shot.
fn calibrate_timer() {
    write(REG_TIMER_INITIAL, u32::MAX);
    time::pit_wait_10ms();
    let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
    write(REG_TIMER_INITIAL, 0);
    TIMER_TICKS_PER_MS.store((elapsed / 10).max(1), Ordering::SeqCst);
}

pub fn id() -> u32 {
    read(REG_ID) >> 24
}

pub fn eoi() {
    write(REG_EOI, 0);
}

pub fn task_priority() -> u8 {
    (read(REG_TPR) >> 4) as u8
}

pub fn set_task_priority(level: u8) {
    write(REG_TPR, (level as u32) << 4);
}

pub fn processor_priority() -> u8 {
    (read(REG_PPR) >> 4) as u8
}

/// Arm the one-shot timer `ns` nanoseconds out, replacing any earlier
/// deadline.
pub fn start_timer(ns: u64) {
    let ticks_per_ms = TIMER_TICKS_PER_MS.load(Ordering::SeqCst) as u64;
    let ticks = (ns * ticks_per_ms / 1_000_000).clamp(1, u32::MAX as u64);
    let lvt = read(REG_LVT_TIMER) & !LVT_MASKED;
    write(REG_LVT_TIMER, lvt);
    write(REG_TIMER_INITIAL, ticks as u32);
}

pub fn configure_timer(vector: u8) {
    write(REG_LVT_TIMER, LVT_MASKED | vector as u32);
}

/// Send a fixed-delivery IPI.
pub fn send_ipi(target: IpiShorthand, vector: u8) {
    match target {
        IpiShorthand::None(lapic_id) => {
            write(REG_ICR_HIGH, (lapic_id as u32) << 24);
            write(REG_ICR_LOW, vector as u32 | (1 << 14));
        }
        IpiShorthand::AllExcludingSelf => {
            write(REG_ICR_LOW, vector as u32 | (1 << 14) | (0b11 << 18));
        }
    }
}

/// INIT IPI for the application processor bring-up sequence.
pub fn send_init(lapic_id: u8) {
    write(REG_ICR_HIGH, (lapic_id as u32) << 24);
    write(REG_ICR_LOW, (0b101 << 8) | (1 << 14));
}

/// Startup IPI pointing the processor at `vector << 12`.
pub fn send_startup(lapic_id: u8, vector: u8) {
    write(REG_ICR_HIGH, (lapic_id as u32) << 24);
    write(REG_ICR_LOW, (0b110 << 8) | vector as u32);
}

/// Wait for the delivery-status bit to clear.
pub fn wait_for_ipi_delivery(limit_ns: u64) -> Result {
    let deadline = time::timestamp().saturating_add(limit_ns);
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        if time::timestamp() > deadline {
            return Err(Status::TimedOut);
        }
        core::hint::spin_loop();
    }
    Ok(())
}
