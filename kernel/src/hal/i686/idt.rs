//! Interrupt descriptor table and the common interrupt entry path.
//!
//! A generated table of 256 tiny stubs normalizes every vector onto one
//! entry frame (vector number plus an error code, zero where the CPU pushes
//! none), saves the register file and funnels into Rust. Exceptions route
//! to panic unless the page-fault handler can prove the fault is stale TLB
//! state; everything else dispatches through the vector table.

use core::arch::global_asm;
use core::mem::size_of;

use x86::controlregs::cr2;

use crate::hal::i686::gdt::KERNEL_CODE_SELECTOR;
use crate::hal::i686::memory;
use crate::it;
use crate::ke::panic::{panic_ex, PanicCode};

const IDT_ENTRY_COUNT: usize = 256;

const GATE_INTERRUPT: u8 = 0x8E;
const GATE_USER_CALLABLE: u8 = 0xEE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    isr_low: u16,
    selector: u16,
    reserved: u8,
    flags: u8,
    isr_high: u16,
}

impl IdtEntry {
    const fn empty() -> IdtEntry {
        IdtEntry {
            isr_low: 0,
            selector: 0,
            reserved: 0,
            flags: 0,
            isr_high: 0,
        }
    }

    fn gate(handler: usize, flags: u8) -> IdtEntry {
        IdtEntry {
            isr_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            reserved: 0,
            flags,
            isr_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_ENTRY_COUNT] = [IdtEntry::empty(); IDT_ENTRY_COUNT];

// Saved register file below the vector/error/iret words, in push order.
#[repr(C)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Present only on ring transitions.
    pub user_esp: u32,
    pub user_ss: u32,
}

// One stub per vector: push a zero error code where the CPU pushes none,
// push the vector on top, join the common path. Vectors 8, 10..14 and 17
// carry a CPU error code that is already in the right frame slot.
global_asm!(
    r#"
.altmacro
.macro interrupt_stub vector
interrupt_stub_\vector:
.if (\vector == 8) || (\vector == 10) || (\vector == 11) || (\vector == 12) || (\vector == 13) || (\vector == 14) || (\vector == 17)
    push \vector
.else
    push 0
    push \vector
.endif
    jmp interrupt_common
.endm

.macro interrupt_stub_ref vector
    .long interrupt_stub_\vector
.endm

.section .text
interrupt_common:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov eax, esp
    push eax
    call {entry}
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd

.set vector, 0
.rept 256
    interrupt_stub %vector
    .set vector, vector + 1
.endr

.section .rodata
.global interrupt_stub_table
interrupt_stub_table:
.set vector, 0
.rept 256
    interrupt_stub_ref %vector
    .set vector, vector + 1
.endr
.section .text
"#,
    entry = sym interrupt_entry
);

unsafe extern "C" {
    static interrupt_stub_table: [u32; IDT_ENTRY_COUNT];
}

extern "C" fn interrupt_entry(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as u8;
    if (vector as usize) < it::FIRST_INTERRUPT_VECTOR as usize {
        handle_exception(frame);
    } else {
        it::dispatch_interrupt(vector);
    }
}

fn caused_by_kernel(frame: &InterruptFrame) -> bool {
    frame.cs as u16 & 3 == 0
}

fn handle_exception(frame: &mut InterruptFrame) {
    match frame.vector {
        1 | 3 => {
            // Debug and breakpoint traps are logged and survived.
            log::debug!("trap {} at {:#x}", frame.vector, frame.eip);
        }
        14 => {
            let address = unsafe { cr2() };
            if memory::reconcile_page_fault(address, frame.error_code) {
                // Stale TLB entry; the retry after invlpg will succeed.
                return;
            }
            if caused_by_kernel(frame) {
                panic_ex(
                    PanicCode::KernelModeFault,
                    [
                        14,
                        address,
                        frame.error_code as usize,
                        frame.eip as usize,
                    ],
                );
            }
            // Fault in user mode with no reconciliation: the task dies.
            log::error!(
                "user page fault at {address:#x} (error {:#x}), terminating task",
                frame.error_code
            );
            crate::ke::sched::finish_current();
        }
        2 => panic_ex(PanicCode::KernelModeFault, [2, 0, 0, frame.eip as usize]),
        8 => panic_ex(
            PanicCode::KernelModeFault,
            [8, frame.error_code as usize, 0, frame.eip as usize],
        ),
        18 => panic_ex(PanicCode::KernelModeFault, [18, 0, 0, frame.eip as usize]),
        vector => panic_ex(
            PanicCode::KernelModeFault,
            [
                vector as usize,
                frame.error_code as usize,
                0,
                frame.eip as usize,
            ],
        ),
    }
}

/// Build the shared IDT. The exception gates are fixed; driver vectors get
/// their gates through [`ensure_gate`].
///
/// # Safety
/// Must run once before interrupts are enabled.
pub unsafe fn init() {
    unsafe {
        let idt = &raw mut IDT;
        let stubs = &interrupt_stub_table;
        for vector in 0..IDT_ENTRY_COUNT {
            (*idt)[vector] = IdtEntry::gate(stubs[vector] as usize, GATE_INTERRUPT);
        }
    }
    load();
}

/// Load the IDT register on the calling CPU.
pub fn load() {
    unsafe {
        let pointer = IdtPointer {
            limit: (size_of::<IdtEntry>() * IDT_ENTRY_COUNT - 1) as u16,
            base: &raw const IDT as u32,
        };
        core::arch::asm!("lidt [{0}]", in(reg) &pointer, options(nostack));
    }
}

/// All gates are pre-installed; `user_callable` widens the descriptor
/// privilege for software interrupts from ring 3.
pub fn ensure_gate(vector: u8, user_callable: bool) {
    unsafe {
        let idt = &raw mut IDT;
        let stubs = &interrupt_stub_table;
        let flags = if user_callable {
            GATE_USER_CALLABLE
        } else {
            GATE_INTERRUPT
        };
        (*idt)[vector as usize] = IdtEntry::gate(stubs[vector as usize] as usize, flags);
    }
}
