//! ACPI MADT discovery and application processor startup.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use acpi::{AcpiTables, PhysicalMapping};

use crate::config::PAGE_SIZE;
use crate::hal::i686::{cpu, gdt, idt, ioapic, irq, lapic, memory};
use crate::it;
use crate::ke::sched;
use crate::mm::{dynmap, PageFlags, PhysAddr};
use crate::status::{Result, Status};

#[derive(Clone)]
struct AcpiMapper;

impl acpi::Handler for AcpiMapper {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> PhysicalMapping<Self, T> {
        let mapped = dynmap::map_dynamic(physical_address, size, PageFlags::empty())
            .expect("ACPI table mapping failed");
        let mapped_length = crate::rtl::align_up(size + physical_address % PAGE_SIZE, PAGE_SIZE);
        PhysicalMapping {
            physical_start: physical_address,
            virtual_start: NonNull::new(mapped as *mut T).unwrap(),
            region_length: size,
            mapped_length,
            handler: self.clone(),
        }
    }

    fn unmap_physical_region<T>(region: &PhysicalMapping<Self, T>) {
        let _ = dynmap::unmap_dynamic(region.virtual_start.as_ptr() as usize);
    }

    fn read_u8(&self, _address: usize) -> u8 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_u16(&self, _address: usize) -> u16 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_u32(&self, _address: usize) -> u32 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_u64(&self, _address: usize) -> u64 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_u8(&self, _address: usize, _value: u8) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_u16(&self, _address: usize, _value: u16) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_u32(&self, _address: usize, _value: u32) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_u64(&self, _address: usize, _value: u64) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_io_u8(&self, _port: u16) -> u8 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_io_u16(&self, _port: u16) -> u16 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_io_u32(&self, _port: u16) -> u32 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_io_u8(&self, _port: u16, _value: u8) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_io_u16(&self, _port: u16, _value: u16) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_io_u32(&self, _port: u16, _value: u32) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_pci_u8(&self, _address: acpi::PciAddress, _offset: u16) -> u8 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_pci_u16(&self, _address: acpi::PciAddress, _offset: u16) -> u16 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn read_pci_u32(&self, _address: acpi::PciAddress, _offset: u16) -> u32 {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_pci_u8(&self, _address: acpi::PciAddress, _offset: u16, _value: u8) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_pci_u16(&self, _address: acpi::PciAddress, _offset: u16, _value: u16) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn write_pci_u32(&self, _address: acpi::PciAddress, _offset: u16, _value: u32) {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn nanos_since_boot(&self) -> u64 {
        crate::hal::i686::time::timestamp()
    }

    fn stall(&self, microseconds: u64) {
        crate::ke::sleep::delay(microseconds * 1000);
    }

    fn sleep(&self, milliseconds: u64) {
        crate::ke::sleep::delay(milliseconds * 1_000_000);
    }

    fn create_mutex(&self) -> acpi::Handle {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn acquire(
        &self,
        _mutex: acpi::Handle,
        _timeout: u16,
    ) -> core::result::Result<(), acpi::aml::AmlError> {
        unimplemented!("the kernel core does not interpret AML")
    }

    fn release(&self, _mutex: acpi::Handle) {
        unimplemented!("the kernel core does not interpret AML")
    }
}

/// Walk the MADT: CPU inventory, I/O APIC location, ISA overrides.
pub fn init_from_acpi(rsdp_address: usize) -> Result {
    let tables = unsafe { AcpiTables::from_rsdp(AcpiMapper, rsdp_address) }
        .map_err(|_| Status::NotCompatible)?;
    let platform =
        acpi::platform::PlatformInfo::new(&tables).map_err(|_| Status::NotCompatible)?;

    if let Some(processors) = &platform.processor_info {
        cpu::register_cpu(0, processors.boot_processor.local_apic_id as u8);
        let mut index = 1;
        for processor in processors.application_processors.iter() {
            if processor.state == acpi::platform::ProcessorState::Disabled {
                continue;
            }
            cpu::register_cpu(index, processor.local_apic_id as u8);
            index += 1;
        }
    }

    irq::set_default_isa_remap();
    if let acpi::InterruptModel::Apic(apic) = &platform.interrupt_model {
        if let Some(io_apic) = apic.io_apics.first() {
            ioapic::init(
                io_apic.address as PhysAddr,
                io_apic.global_system_interrupt_base,
            )?;
        }
        for source_override in apic.interrupt_source_overrides.iter() {
            let _ = irq::add_isa_remap_entry(
                source_override.isa_source,
                source_override.global_system_interrupt,
            );
        }
    }

    Ok(())
}

// Real-mode trampoline, copied to a fixed page below 1 MiB. All absolute
// references are computed against the copy address, so the blob is
// position-independent with respect to where the kernel linked it. The
// embedded GDT carries flat code/data; the AP later loads the real one.
core::arch::global_asm!(
    r#"
.section .text
.global ap_trampoline_start
.global ap_trampoline_end
.code16
ap_trampoline_start:
    cli
    xor ax, ax
    mov ds, ax
    lgdt [{base} + (ap_boot_gdt_descriptor - ap_trampoline_start)]
    mov eax, cr0
    or eax, 1
    mov cr0, eax
    ljmp 0x08, {base} + (ap_trampoline_32 - ap_trampoline_start)
.code32
ap_trampoline_32:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov eax, [{handoff_cr3}]
    mov cr3, eax
    mov eax, cr0
    or eax, 0x80000000
    mov cr0, eax
    mov esp, [{handoff_stack}]
    mov eax, [{handoff_entry}]
    call eax
1:  hlt
    jmp 1b

.balign 8
ap_boot_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
ap_boot_gdt_descriptor:
    .word 23
    .long {base} + (ap_boot_gdt - ap_trampoline_start)
ap_trampoline_end:
.code32
"#,
    base = const TRAMPOLINE_ADDRESS,
    handoff_cr3 = const HANDOFF_CR3,
    handoff_stack = const HANDOFF_STACK,
    handoff_entry = const HANDOFF_ENTRY,
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

const TRAMPOLINE_ADDRESS: usize = 0x1000;
const HANDOFF_CR3: usize = 0x1F10;
const HANDOFF_STACK: usize = 0x1F14;
const HANDOFF_ENTRY: usize = 0x1F18;

static AP_READY: AtomicU32 = AtomicU32::new(0);

extern "C" fn ap_entry() -> ! {
    unsafe {
        gdt::init(cpu::current_cpu());
    }
    idt::load();
    let _ = lapic::init(it::SYSTEM_TIMER_VECTOR);
    AP_READY.fetch_add(1, Ordering::SeqCst);
    sched::join();
}

/// INIT-SIPI-SIPI bring-up for every discovered application processor.
pub fn start_application_processors() -> Result {
    if cpu::cpu_count() <= 1 {
        return Ok(());
    }

    // Identity-map the trampoline page so it is reachable both before and
    // after the AP enables paging.
    match memory::map_page(
        TRAMPOLINE_ADDRESS,
        TRAMPOLINE_ADDRESS,
        PageFlags::WRITABLE | PageFlags::CACHE_DISABLE,
    ) {
        Ok(()) | Err(Status::MemoryAlreadyMapped) => {}
        Err(e) => return Err(e),
    }

    unsafe {
        let start = &ap_trampoline_start as *const u8;
        let end = &ap_trampoline_end as *const u8;
        let length = end as usize - start as usize;
        memory::write_bytes_at(
            TRAMPOLINE_ADDRESS,
            core::slice::from_raw_parts(start, length),
        );
        memory::write_bytes_at(
            HANDOFF_CR3,
            &(memory::current_address_space_root() as u32).to_le_bytes(),
        );
        memory::write_bytes_at(HANDOFF_ENTRY, &(ap_entry as usize as u32).to_le_bytes());
    }

    let expected = cpu::cpu_count() as u32 - 1;
    for index in 1..cpu::cpu_count() {
        // A page of stack per processor until it joins the scheduler.
        let (stack_pa, _) = crate::mm::physical::allocate(
            PAGE_SIZE,
            PAGE_SIZE,
            crate::mm::physical::PhysPool::Standard,
        )?;
        let stack_top = dynmap::map_dynamic(stack_pa, PAGE_SIZE, PageFlags::WRITABLE)? + PAGE_SIZE;
        unsafe {
            memory::write_bytes_at(HANDOFF_STACK, &(stack_top as u32).to_le_bytes());
        }

        let lapic_id = cpu::lapic_id_of(index);
        let before = AP_READY.load(Ordering::SeqCst);
        lapic::send_init(lapic_id);
        crate::ke::sleep::delay(10_000_000);
        lapic::send_startup(lapic_id, (TRAMPOLINE_ADDRESS >> 12) as u8);
        crate::ke::sleep::delay(1_000_000);
        if AP_READY.load(Ordering::SeqCst) == before {
            lapic::send_startup(lapic_id, (TRAMPOLINE_ADDRESS >> 12) as u8);
        }

        let deadline = crate::hal::i686::time::timestamp() + 100_000_000;
        while AP_READY.load(Ordering::SeqCst) == before {
            if crate::hal::i686::time::timestamp() > deadline {
                log::warn!("CPU {index} did not come up");
                break;
            }
            core::hint::spin_loop();
        }
    }

    if AP_READY.load(Ordering::SeqCst) != expected {
        log::warn!(
            "{} of {} application processors started",
            AP_READY.load(Ordering::SeqCst),
            expected
        );
    }
    Ok(())
}
