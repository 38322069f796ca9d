//! I/O APIC redirection management.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::it::{InterruptParams, InterruptPolarity, InterruptTrigger};
use crate::mm::{dynmap, PageFlags, PhysAddr};
use crate::status::{Result, Status};

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;
const REG_VERSION: u32 = 0x01;
const REG_REDIRECTION_BASE: u32 = 0x10;

const REDIR_MASKED: u64 = 1 << 16;
const REDIR_LEVEL: u64 = 1 << 15;
const REDIR_ACTIVE_LOW: u64 = 1 << 13;

static WINDOW: AtomicUsize = AtomicUsize::new(0);
static GSI_BASE: AtomicU32 = AtomicU32::new(0);
static INPUT_COUNT: AtomicU32 = AtomicU32::new(0);

fn select(register: u32) {
    let base = WINDOW.load(Ordering::Relaxed);
    unsafe {
        core::ptr::write_volatile((base + IOREGSEL) as *mut u32, register);
    }
}

fn read(register: u32) -> u32 {
    select(register);
    let base = WINDOW.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + IOWIN) as *const u32) }
}

fn write(register: u32, value: u32) {
    select(register);
    let base = WINDOW.load(Ordering::Relaxed);
    unsafe {
        core::ptr::write_volatile((base + IOWIN) as *mut u32, value);
    }
}

fn write_redirection(input: u32, entry: u64) {
    write(REG_REDIRECTION_BASE + input * 2, entry as u32);
    write(REG_REDIRECTION_BASE + input * 2 + 1, (entry >> 32) as u32);
}

fn read_redirection(input: u32) -> u64 {
    let low = read(REG_REDIRECTION_BASE + input * 2) as u64;
    let high = read(REG_REDIRECTION_BASE + input * 2 + 1) as u64;
    low | (high << 32)
}

/// Map the controller reported by the MADT and mask every input.
pub fn init(physical: PhysAddr, gsi_base: u32) -> Result {
    let window = dynmap::map_dynamic(
        physical,
        0x20,
        PageFlags::WRITABLE | PageFlags::CACHE_DISABLE,
    )?;
    WINDOW.store(window, Ordering::SeqCst);
    GSI_BASE.store(gsi_base, Ordering::SeqCst);

    let inputs = ((read(REG_VERSION) >> 16) & 0xFF) + 1;
    INPUT_COUNT.store(inputs, Ordering::SeqCst);
    for input in 0..inputs {
        write_redirection(input, REDIR_MASKED);
    }
    Ok(())
}

pub fn is_present() -> bool {
    WINDOW.load(Ordering::SeqCst) != 0
}

fn local_input(gsi: u32) -> Result<u32> {
    let base = GSI_BASE.load(Ordering::SeqCst);
    let count = INPUT_COUNT.load(Ordering::SeqCst);
    if gsi < base || gsi >= base + count {
        return Err(Status::BadVector);
    }
    Ok(gsi - base)
}

pub fn register_input(gsi: u32, vector: u8, params: InterruptParams) -> Result {
    let input = local_input(gsi)?;
    let mut entry = REDIR_MASKED | vector as u64;
    if params.trigger == InterruptTrigger::Level {
        entry |= REDIR_LEVEL;
    }
    if params.polarity == InterruptPolarity::ActiveLow {
        entry |= REDIR_ACTIVE_LOW;
    }
    write_redirection(input, entry);
    Ok(())
}

pub fn unregister_input(gsi: u32) -> Result {
    let input = local_input(gsi)?;
    write_redirection(input, REDIR_MASKED);
    Ok(())
}

pub fn enable_input(gsi: u32) -> Result {
    let input = local_input(gsi)?;
    let entry = read_redirection(input);
    write_redirection(input, entry & !REDIR_MASKED);
    Ok(())
}

pub fn disable_input(gsi: u32) -> Result {
    let input = local_input(gsi)?;
    let entry = read_redirection(input);
    write_redirection(input, entry | REDIR_MASKED);
    Ok(())
}
