//! Inter-processor messaging: TLB shootdown and emergency shutdown.
//!
//! Every CPU owns a fixed array of message slots plus two atomic bitmaps.
//! A sender reserves a slot on the target, fills it, flips the filled bit
//! and raises the IPI; the receiver drains all filled slots and decrements
//! the sender's acknowledgement counter. The sender spins until every
//! target has acknowledged, giving the shootdown acquire semantics.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::MAX_CPU_COUNT;
use crate::hal::i686::{cpu, lapic, memory};
use crate::it::{self, IPI_VECTOR};
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::task::PrivilegeLevel;
use crate::mm::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::rtl::{AtomicBitmap, CpuSet};
use crate::status::Result;

const SLOT_COUNT: u32 = 16;
const DELIVERY_LIMIT_NS: u64 = 100_000;
const BROADCAST_DELIVERY_LIMIT_NS: u64 = 500_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum IpiType {
    None,
    TlbShootdown,
    CpuShutdown,
}

struct IpiSlot {
    kind: core::cell::Cell<IpiType>,
    source: core::cell::Cell<usize>,
    address: core::cell::Cell<VirtAddr>,
    pages: core::cell::Cell<usize>,
    root: core::cell::Cell<PhysAddr>,
    kernel_scope: core::cell::Cell<bool>,
    remaining_acks: core::cell::Cell<*const AtomicU32>,
}

// Slots are handed between CPUs through the reserved/filled bitmaps; a slot
// is only touched by its current owner.
unsafe impl Sync for IpiSlot {}

impl IpiSlot {
    const fn new() -> IpiSlot {
        IpiSlot {
            kind: core::cell::Cell::new(IpiType::None),
            source: core::cell::Cell::new(0),
            address: core::cell::Cell::new(0),
            pages: core::cell::Cell::new(0),
            root: core::cell::Cell::new(0),
            kernel_scope: core::cell::Cell::new(false),
            remaining_acks: core::cell::Cell::new(core::ptr::null()),
        }
    }
}

struct CpuIpiState {
    slots: [IpiSlot; SLOT_COUNT as usize],
    reserved: AtomicBitmap,
    filled: AtomicBitmap,
    remaining_acks: AtomicU32,
}

impl CpuIpiState {
    const fn new() -> CpuIpiState {
        CpuIpiState {
            slots: [const { IpiSlot::new() }; SLOT_COUNT as usize],
            reserved: AtomicBitmap::new(SLOT_COUNT),
            filled: AtomicBitmap::new(SLOT_COUNT),
            remaining_acks: AtomicU32::new(0),
        }
    }
}

static IPI_STATE: [CpuIpiState; MAX_CPU_COUNT] = [const { CpuIpiState::new() }; MAX_CPU_COUNT];
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_ACKS: AtomicU32 = AtomicU32::new(0);

fn handle_ipi(_context: usize) -> Result {
    let cpu = cpu::current_cpu();
    let state = &IPI_STATE[cpu];

    loop {
        let filled = state.filled.load();
        if filled == 0 {
            break;
        }
        for index in 0..SLOT_COUNT {
            if filled & (1 << index) == 0 {
                continue;
            }
            let slot = &state.slots[index as usize];
            match slot.kind.get() {
                IpiType::TlbShootdown => {
                    let relevant = slot.kernel_scope.get()
                        || memory::current_address_space_root() == slot.root.get();
                    if relevant {
                        let mut address = slot.address.get();
                        for _ in 0..slot.pages.get() {
                            memory::invalidate_local(address);
                            address += PAGE_SIZE;
                        }
                    }
                }
                IpiType::CpuShutdown => {
                    let acks = slot.remaining_acks.get();
                    if !acks.is_null() {
                        unsafe { (*acks).fetch_sub(1, Ordering::SeqCst) };
                    }
                    state.filled.clear(index);
                    state.reserved.clear(index);
                    cpu::halt_forever();
                }
                IpiType::None => {
                    panic_ex(
                        PanicCode::IpiUnknownType,
                        [slot.source.get(), cpu, 0, 0],
                    );
                }
            }

            let acks = slot.remaining_acks.get();
            if !acks.is_null() {
                unsafe { (*acks).fetch_sub(1, Ordering::SeqCst) };
            }
            state.filled.clear(index);
            state.reserved.clear(index);
        }
    }
    Ok(())
}

pub fn init() -> Result {
    it::install_handler(IPI_VECTOR, handle_ipi, 0, PrivilegeLevel::Kernel)?;
    it::set_handler_enable(IPI_VECTOR, handle_ipi, true)?;
    INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

fn fill_slot(
    target: usize,
    kind: IpiType,
    source: usize,
    address: VirtAddr,
    pages: usize,
    root: PhysAddr,
    kernel_scope: bool,
    acks: *const AtomicU32,
) {
    let state = &IPI_STATE[target];
    let reservation = state.reserved.reserve_one();
    let slot = &state.slots[reservation.index as usize];
    slot.kind.set(kind);
    slot.source.set(source);
    slot.address.set(address);
    slot.pages.set(pages);
    slot.root.set(root);
    slot.kernel_scope.set(kernel_scope);
    slot.remaining_acks.set(acks);
    state.filled.set(reservation.index);
    // The receiver releases the reservation when it drains the slot.
    core::mem::forget(reservation);
}

/// Shoot down a user-space range on every CPU in `targets` whose current
/// address space matches `root`. Returns once all targets acknowledged.
pub fn send_invalidate(targets: &CpuSet, root: PhysAddr, address: VirtAddr, pages: usize) {
    if !INITIALIZED.load(Ordering::SeqCst) {
        return;
    }
    let cpu = cpu::current_cpu();
    let state = &IPI_STATE[cpu];

    let _highest = prio::raise(PriorityLevel::HIGHEST);

    let mut acks = targets.count().min(cpu::cpu_count());
    if targets.contains(cpu) {
        acks -= 1;
    }
    state.remaining_acks.store(acks as u32, Ordering::SeqCst);
    if acks == 0 {
        return;
    }

    for target in 0..cpu::cpu_count() {
        if target == cpu || !targets.contains(target) {
            continue;
        }
        fill_slot(
            target,
            IpiType::TlbShootdown,
            cpu,
            address,
            pages,
            root,
            false,
            &state.remaining_acks,
        );
        lapic::send_ipi(
            lapic::IpiShorthand::None(cpu::lapic_id_of(target)),
            IPI_VECTOR,
        );
        if lapic::wait_for_ipi_delivery(DELIVERY_LIMIT_NS).is_err() {
            panic_ex(PanicCode::IpiDeliveryTimeout, [cpu, target, 0, 0]);
        }
    }

    while state.remaining_acks.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}

/// Kernel-scope shootdown: all CPUs invalidate unconditionally.
pub fn send_invalidate_kernel(address: VirtAddr, pages: usize) {
    if !INITIALIZED.load(Ordering::SeqCst) || cpu::cpu_count() <= 1 {
        return;
    }
    let cpu = cpu::current_cpu();
    let state = &IPI_STATE[cpu];

    let _highest = prio::raise(PriorityLevel::HIGHEST);
    state
        .remaining_acks
        .store(cpu::cpu_count() as u32 - 1, Ordering::SeqCst);

    for target in 0..cpu::cpu_count() {
        if target == cpu {
            continue;
        }
        fill_slot(
            target,
            IpiType::TlbShootdown,
            cpu,
            address,
            pages,
            0,
            true,
            &state.remaining_acks,
        );
    }

    lapic::send_ipi(lapic::IpiShorthand::AllExcludingSelf, IPI_VECTOR);
    if lapic::wait_for_ipi_delivery(BROADCAST_DELIVERY_LIMIT_NS).is_err() {
        panic_ex(PanicCode::IpiDeliveryTimeout, [cpu, usize::MAX, 0, 0]);
    }

    while state.remaining_acks.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}

/// Stop every other CPU; used on the panic path.
pub fn send_shutdown_cpus() {
    if !INITIALIZED.load(Ordering::SeqCst) || cpu::cpu_count() <= 1 {
        return;
    }
    let cpu = cpu::current_cpu();

    let _highest = prio::raise(PriorityLevel::HIGHEST);
    SHUTDOWN_ACKS.store(cpu::cpu_count() as u32 - 1, Ordering::SeqCst);

    for target in 0..cpu::cpu_count() {
        if target == cpu {
            continue;
        }
        fill_slot(
            target,
            IpiType::CpuShutdown,
            cpu,
            0,
            0,
            0,
            false,
            &SHUTDOWN_ACKS,
        );
    }

    lapic::send_ipi(lapic::IpiShorthand::AllExcludingSelf, IPI_VECTOR);
    let _ = lapic::wait_for_ipi_delivery(BROADCAST_DELIVERY_LIMIT_NS);

    while SHUTDOWN_ACKS.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}
