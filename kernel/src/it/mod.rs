//! Interrupt table management and dispatch.
//!
//! Vectors 0..31 are exceptions, owned by the architecture layer. 32..47 are
//! reserved for fixed kernel uses (the system timer lives at 32), 48..255
//! belong to drivers and are handed out by [`find_free_vector`]. Several
//! handlers may share one vector; dispatch calls them in registration order.

use alloc::vec::Vec;

use crate::hal;
use crate::ke::dpc;
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::task::PrivilegeLevel;
use crate::ke::SpinLock;
use crate::status::{Result, Status};

pub const VECTOR_COUNT: usize = 256;
pub const FIRST_INTERRUPT_VECTOR: u8 = 32;
pub const IRQ_VECTOR_BASE: u8 = 48;
pub const SYSTEM_TIMER_VECTOR: u8 = FIRST_INTERRUPT_VECTOR;
pub const IPI_VECTOR: u8 = 224;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    #[default]
    Fixed,
    LowestPriority,
    Smi,
    Nmi,
    Init,
    ExtInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptPolarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptTrigger {
    #[default]
    Edge,
    Level,
}

/// External interrupt routing parameters, as carried by device resource
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptParams {
    pub mode: InterruptMode,
    pub polarity: InterruptPolarity,
    pub trigger: InterruptTrigger,
    pub shared: bool,
    pub wake: bool,
}

pub type InterruptHandler = fn(usize) -> Result;

struct VectorEntry {
    handlers: Vec<(InterruptHandler, usize)>,
    reserved: bool,
}

const EMPTY_VECTOR: SpinLock<VectorEntry> = SpinLock::new(VectorEntry {
    handlers: Vec::new(),
    reserved: false,
});

static VECTORS: [SpinLock<VectorEntry>; VECTOR_COUNT] = [EMPTY_VECTOR; VECTOR_COUNT];

/// Mark a vector as used. Idempotent.
pub fn reserve_vector(vector: u8) -> Result {
    if vector < FIRST_INTERRUPT_VECTOR {
        return Err(Status::BadVector);
    }
    VECTORS[vector as usize].lock().reserved = true;
    Ok(())
}

/// Lowest free vector in the driver band.
pub fn find_free_vector() -> Result<u8> {
    for vector in IRQ_VECTOR_BASE..=u8::MAX {
        let mut entry = VECTORS[vector as usize].lock();
        if !entry.reserved {
            entry.reserved = true;
            return Ok(vector);
        }
    }
    Err(Status::NoFreeVectors)
}

pub fn release_vector(vector: u8) {
    if vector >= IRQ_VECTOR_BASE {
        let mut entry = VECTORS[vector as usize].lock();
        if entry.handlers.is_empty() {
            entry.reserved = false;
        }
    }
}

pub fn install_handler(
    vector: u8,
    handler: InterruptHandler,
    context: usize,
    privilege: PrivilegeLevel,
) -> Result {
    if vector < FIRST_INTERRUPT_VECTOR {
        return Err(Status::BadVector);
    }
    {
        let mut entry = VECTORS[vector as usize].lock();
        if entry
            .handlers
            .iter()
            .any(|(h, c)| *h == handler && *c == context)
        {
            return Err(Status::AlreadyRegistered);
        }
        entry.handlers.push((handler, context));
        entry.reserved = true;
    }
    hal::ensure_gate(vector);
    let _ = privilege;
    Ok(())
}

pub fn uninstall_handler(vector: u8, handler: InterruptHandler) -> Result {
    if vector < FIRST_INTERRUPT_VECTOR {
        return Err(Status::BadVector);
    }
    let mut entry = VECTORS[vector as usize].lock();
    let before = entry.handlers.len();
    entry.handlers.retain(|(h, _)| *h != handler);
    if entry.handlers.len() == before {
        return Err(Status::NotRegistered);
    }
    Ok(())
}

/// Mask or unmask the IRQ line behind a vector, when the controller binds
/// lines to vectors (dual PIC). I/O APIC inputs are controlled through their
/// registration instead.
pub fn set_handler_enable(vector: u8, handler: InterruptHandler, enable: bool) -> Result {
    {
        let entry = VECTORS[vector as usize].lock();
        if !entry.handlers.iter().any(|(h, _)| *h == handler) {
            return Err(Status::NotRegistered);
        }
    }
    if hal::irq_vector_is_line_bound() && (IRQ_VECTOR_BASE..IRQ_VECTOR_BASE + 16).contains(&vector)
    {
        let input = (vector - IRQ_VECTOR_BASE) as u32;
        if enable {
            hal::irq_enable(input)?;
        } else {
            hal::irq_disable(input)?;
        }
    }
    Ok(())
}

/// Priority class implied by a vector number.
fn vector_level(vector: u8) -> PriorityLevel {
    PriorityLevel::from_raw(vector >> 4).unwrap_or(PriorityLevel::HIGHEST)
}

/// Run the handlers of an external interrupt vector, signal end of
/// interrupt and drain any deferred work. Entered from the architecture
/// stubs; the hosted test build calls it directly.
pub fn dispatch_interrupt(vector: u8) {
    if hal::irq_is_spurious() {
        return;
    }

    {
        let level = vector_level(vector).max(prio::current());
        let _interrupt = prio::raise(level);
        let handlers = VECTORS[vector as usize].lock().handlers.clone();
        for (handler, context) in handlers {
            if let Err(e) = handler(context) {
                log::warn!("vector {vector} handler failed: {e}");
            }
        }
    }

    let _ = hal::irq_eoi(vector);
    dpc::process_queue();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(step: usize) -> Result {
        CALLS.fetch_add(step, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn free_vectors_start_at_the_driver_band() {
        let v = find_free_vector().unwrap();
        assert!(v >= IRQ_VECTOR_BASE);
        let next = find_free_vector().unwrap();
        assert_ne!(v, next);
        release_vector(v);
        release_vector(next);
    }

    #[test]
    fn exception_band_is_rejected() {
        assert_eq!(reserve_vector(3), Err(Status::BadVector));
        assert_eq!(
            install_handler(14, count_handler, 0, PrivilegeLevel::Kernel),
            Err(Status::BadVector)
        );
    }

    #[test]
    fn reserving_twice_is_idempotent() {
        assert_eq!(reserve_vector(200), Ok(()));
        assert_eq!(reserve_vector(200), Ok(()));
    }

    #[test]
    fn handlers_dispatch_in_registration_order() {
        install_handler(100, count_handler, 1, PrivilegeLevel::Kernel).unwrap();
        install_handler(100, count_handler, 10, PrivilegeLevel::Kernel).unwrap();
        assert_eq!(
            install_handler(100, count_handler, 1, PrivilegeLevel::Kernel),
            Err(Status::AlreadyRegistered)
        );

        let before = CALLS.load(Ordering::SeqCst);
        dispatch_interrupt(100);
        assert_eq!(CALLS.load(Ordering::SeqCst) - before, 11);

        uninstall_handler(100, count_handler).unwrap();
        let before = CALLS.load(Ordering::SeqCst);
        dispatch_interrupt(100);
        assert_eq!(CALLS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn uninstalling_unknown_handler_fails() {
        assert_eq!(
            uninstall_handler(101, count_handler),
            Err(Status::NotRegistered)
        );
    }
}
