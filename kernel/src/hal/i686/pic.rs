//! Dual 8259 PIC fallback, used when the machine has no I/O APIC.

use pic8259::ChainedPics;

use crate::it::IRQ_VECTOR_BASE;
use crate::ke::SpinLock;
use crate::status::{Result, Status};

pub const PIC_INPUT_COUNT: u32 = 16;

static PICS: SpinLock<ChainedPics> =
    SpinLock::new(unsafe { ChainedPics::new(IRQ_VECTOR_BASE, IRQ_VECTOR_BASE + 8) });

/// Remap the controllers onto the kernel's IRQ vector base and mask
/// everything.
pub fn init() {
    let mut pics = PICS.lock();
    unsafe {
        pics.initialize();
        pics.write_masks(0xFF, 0xFF);
    }
}

fn with_masks(f: impl FnOnce(u16) -> u16) {
    let mut pics = PICS.lock();
    let masks = pics.read_masks();
    let current = masks[0] as u16 | ((masks[1] as u16) << 8);
    let updated = f(current);
    unsafe { pics.write_masks(updated as u8, (updated >> 8) as u8) };
}

pub fn enable_irq(input: u32) -> Result {
    if input >= PIC_INPUT_COUNT {
        return Err(Status::BadVector);
    }
    with_masks(|masks| masks & !(1 << input));
    Ok(())
}

pub fn disable_irq(input: u32) -> Result {
    if input >= PIC_INPUT_COUNT {
        return Err(Status::BadVector);
    }
    with_masks(|masks| masks | (1 << input));
    Ok(())
}

pub fn send_eoi(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

/// IRQ 7 and 15 fire spuriously when a level drops early; the in-service
/// register tells them apart from real ones.
pub fn is_spurious() -> bool {
    unsafe {
        x86::io::outb(0x20, 0x0B);
        let isr_master = x86::io::inb(0x20);
        if isr_master & 0x80 == 0 {
            // Could be the spurious IRQ7.
            x86::io::outb(0xA0, 0x0B);
            let isr_slave = x86::io::inb(0xA0);
            return isr_slave & 0x80 == 0;
        }
    }
    false
}
