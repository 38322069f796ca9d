//! IRQ controller mux: one API over the dual PIC or the I/O APIC.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::i686::{ioapic, lapic, pic};
use crate::it::{InterruptParams, IRQ_VECTOR_BASE};
use crate::ke::SpinLock;
use crate::status::{Result, Status};

const ISA_INTERRUPT_COUNT: usize = 16;

static USE_IOAPIC: AtomicBool = AtomicBool::new(false);
static ISA_REMAP: SpinLock<[u32; ISA_INTERRUPT_COUNT]> =
    SpinLock::new([0; ISA_INTERRUPT_COUNT]);

/// Pick the controller: the PIC is always remapped and masked; the I/O APIC
/// wins when the MADT reported one.
pub fn init() {
    pic::init();
    USE_IOAPIC.store(ioapic::is_present(), Ordering::SeqCst);
    if !use_ioapic() {
        set_default_isa_remap();
    }
}

fn use_ioapic() -> bool {
    USE_IOAPIC.load(Ordering::SeqCst)
}

pub fn set_default_isa_remap() {
    let mut table = ISA_REMAP.lock();
    for (irq, entry) in table.iter_mut().enumerate() {
        *entry = irq as u32;
    }
}

/// Record an interrupt source override from the MADT.
pub fn add_isa_remap_entry(isa_irq: u8, gsi: u32) -> Result {
    if isa_irq as usize >= ISA_INTERRUPT_COUNT {
        return Err(Status::BadVector);
    }
    ISA_REMAP.lock()[isa_irq as usize] = gsi;
    Ok(())
}

/// Legacy IRQ number to global system interrupt.
pub fn resolve_isa_irq(irq: u32) -> u32 {
    if use_ioapic() && (irq as usize) < ISA_INTERRUPT_COUNT {
        return ISA_REMAP.lock()[irq as usize];
    }
    irq
}

pub fn irq_register(input: u32, vector: u8, params: InterruptParams) -> Result {
    if use_ioapic() {
        ioapic::register_input(input, vector, params)
    } else if input >= pic::PIC_INPUT_COUNT {
        Err(Status::VectorNotFree)
    } else {
        // The PIC binds inputs to vectors rigidly; nothing to program.
        Ok(())
    }
}

pub fn irq_unregister(input: u32) -> Result {
    if use_ioapic() {
        ioapic::unregister_input(input)
    } else {
        Ok(())
    }
}

pub fn irq_enable(input: u32) -> Result {
    if use_ioapic() {
        ioapic::enable_input(input)
    } else {
        pic::enable_irq(input)
    }
}

pub fn irq_disable(input: u32) -> Result {
    if use_ioapic() {
        ioapic::disable_input(input)
    } else {
        pic::disable_irq(input)
    }
}

pub fn irq_eoi(vector: u8) -> Result {
    if !use_ioapic() && (IRQ_VECTOR_BASE..IRQ_VECTOR_BASE + 16).contains(&vector) {
        pic::send_eoi(vector);
    }
    lapic::eoi();
    Ok(())
}

pub fn irq_is_spurious() -> bool {
    if use_ioapic() {
        false
    } else {
        pic::is_spurious()
    }
}

/// Whether vector numbers are hard-wired to IRQ inputs (PIC mode).
pub fn irq_vector_is_line_bound() -> bool {
    !use_ioapic()
}

pub fn vector_for_irq_input(input: u32) -> u32 {
    if use_ioapic() {
        input
    } else {
        input + IRQ_VECTOR_BASE as u32
    }
}
