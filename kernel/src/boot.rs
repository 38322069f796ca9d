//! Kernel bring-up on the bootstrap processor.
//!
//! The early boot stub (separate, below the kernel proper) has already
//! switched to protected mode, built the initial kernel mapping with the
//! self-referencing directory and jumped here with a multiboot2 information
//! pointer. This module orders the subsystem bring-up and hands control to
//! the scheduler; `kernel_init` then runs as the first real task.

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

use crate::config::{KERNEL_SPACE_BASE, PAGE_SIZE, TIME_SLICE_NS};
use crate::ex;
use crate::hal::i686::{cpu, gdt, idt, ipi, irq, lapic, memory, smp, time};
use crate::io::dev;
use crate::it;
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::sched;
use crate::mm::{heap, physical};
use crate::{logger, rtl};

/// Main ID the root (ACPI) bus driver registers under.
const ROOT_DEVICE_ID: &str = "ROOT/ACPI";

/// Entered from the boot stub with paging up and a 32-bit multiboot2 info
/// pointer.
///
/// # Safety
/// Must be called exactly once, on the bootstrap processor, with a valid
/// multiboot2 information structure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_main(multiboot_info: usize) -> ! {
    let _ = logger::init();
    log::info!(
        "{} {} starting",
        crate::config::KERNEL_NAME,
        crate::config::KERNEL_VERSION
    );

    let boot_info =
        match unsafe { BootInformation::load(multiboot_info as *const BootInformationHeader) } {
            Ok(info) => info,
            Err(_) => panic_ex(PanicCode::BootFailure, [multiboot_info, 0, 0, 0]),
        };

    // Physical pools: free what the firmware reports usable, then take the
    // kernel image and boot structures back out.
    match boot_info.memory_map_tag() {
        Some(memory_map) => {
            for area in memory_map.memory_areas() {
                if MemoryAreaType::from(area.typ()) == MemoryAreaType::Available {
                    physical::add_usable_range(
                        area.start_address() as usize,
                        area.size() as usize,
                    );
                }
            }
        }
        None => panic_ex(PanicCode::BootFailure, [1, 0, 0, 0]),
    }
    reserve_boot_ranges(&boot_info);

    unsafe {
        gdt::init(0);
        idt::init();
    }

    if memory::init_kernel_tables().is_err() {
        panic_ex(PanicCode::BootFailure, [2, 0, 0, 0]);
    }
    heap::init();

    time::init();

    // The boot information carries a copy of the RSDP behind the 8-byte
    // tag header.
    let rsdp = boot_info
        .rsdp_v2_tag()
        .map(|tag| tag as *const _ as usize + 8)
        .or_else(|| {
            boot_info
                .rsdp_v1_tag()
                .map(|tag| tag as *const _ as usize + 8)
        });
    match rsdp {
        Some(rsdp) => {
            if let Err(e) = smp::init_from_acpi(rsdp) {
                log::warn!("ACPI discovery failed ({e}); continuing uniprocessor");
            }
        }
        None => log::warn!("no RSDP from the bootloader; continuing uniprocessor"),
    }

    if lapic::init(it::SYSTEM_TIMER_VECTOR).is_err() {
        panic_ex(PanicCode::BootFailure, [3, 0, 0, 0]);
    }
    cpu::mark_lapic_ready();
    irq::init();
    if ipi::init().is_err() {
        panic_ex(PanicCode::BootFailure, [4, 0, 0, 0]);
    }

    register_kernel_symbols();

    log::info!(
        "bring-up complete: {} CPU(s), slice {} ms",
        cpu::cpu_count(),
        TIME_SLICE_NS / 1_000_000
    );

    sched::start(Some(("KernelInit", kernel_init, 0)));
}

fn reserve_boot_ranges(boot_info: &BootInformation<'_>) {
    // Everything below 1 MiB stays reserved for the CPU bootstrap and ISA
    // DMA until explicitly allocated from the low pool.
    physical::reserve_range(0, 0x10_0000);

    // The kernel image itself.
    if let Some(sections) = boot_info.elf_sections() {
        for section in sections {
            let start = section.start_address() as usize;
            if start == 0 {
                continue;
            }
            // Link addresses are in the kernel half; physical = virtual -
            // base for the boot mapping.
            let physical_start = if start >= KERNEL_SPACE_BASE {
                start - KERNEL_SPACE_BASE
            } else {
                start
            };
            physical::reserve_range(
                rtl::align_down(physical_start, PAGE_SIZE),
                rtl::align_up(section.size() as usize, PAGE_SIZE),
            );
        }
    }

    // Boot modules (the initial ramdisk).
    for module in boot_info.module_tags() {
        physical::reserve_range(
            rtl::align_down(module.start_address() as usize, PAGE_SIZE),
            rtl::align_up(
                (module.end_address() - module.start_address()) as usize,
                PAGE_SIZE,
            ),
        );
    }
}

/// Exported kernel entry points resolvable from driver images.
fn register_kernel_symbols() {
    use crate::ex::ksym::register;

    register("IoCreateRp", crate::io::rp::create_rp as usize);
    register("IoFreeRp", crate::io::rp::free_rp as usize);
    register("IoStartRp", crate::io::rp::start_rp as usize);
    register("IoFinalizeRp", crate::io::rp::finalize_rp as usize);
    register("IoCancelRp", crate::io::rp::cancel_rp as usize);
    register("IoMarkRpPending", crate::io::rp::mark_pending as usize);
    register(
        "IoWaitForRpCompletion",
        crate::io::rp::wait_for_completion as usize,
    );
    register("IoCreateDevice", dev::create_device as usize);
    register("IoAttachDevice", dev::attach_device as usize);
    register("IoRegisterDevice", dev::register_device as usize);
    register("IoSendRp", dev::send_rp as usize);
    register("IoSendRpDown", dev::send_rp_down as usize);
    register("KeSleep", crate::ke::sleep::sleep as usize);
    register("KeEventSleep", sched::event_sleep as usize);
    register(
        "ItInstallInterruptHandler",
        it::install_handler as usize,
    );
    register("ItFindFreeVector", it::find_free_vector as usize);
    register("HalResolveIsaIrq", irq::resolve_isa_irq as usize);
}

/// First scheduled task: bring the driver world up.
fn kernel_init(_context: usize) {
    // The boot filesystem provider is installed by the ramdisk unpacker
    // before the driver manager needs it.
    if let Err(e) = ex::driver::init_driver_manager() {
        panic_ex(PanicCode::BootFailure, [e as usize, 10, 0, 0]);
    }
    if let Err(e) = dev::init_device_manager(ROOT_DEVICE_ID) {
        panic_ex(PanicCode::BootFailure, [e as usize, 11, 0, 0]);
    }

    if let Err(e) = smp::start_application_processors() {
        log::warn!("application processor startup failed: {e}");
    }

    log::info!("kernel initialization complete");
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("rust panic: {info}");
    crate::hal::halt_all_cpus()
}
