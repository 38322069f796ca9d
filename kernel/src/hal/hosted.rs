//! Hosted HAL backing the unit tests.
//!
//! Implements the architecture contract with plain data structures: a
//! software page-table map, an atomic test clock, per-CPU priority words and
//! recording stubs for the IRQ controller. Context "switches" only run the
//! scheduler's inbound bookkeeping; the tests drive scheduling decisions
//! directly.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::config::{KERNEL_SPACE_BASE, MAX_CPU_COUNT, PAGE_SIZE};
use crate::it::InterruptParams;
use crate::ke::task::{Task, TaskEntry};
use crate::ke::SpinLock;
use crate::mm::{PageFlags, PhysAddr, VirtAddr};
use crate::rtl::CpuSet;
use crate::status::{Result, Status};

// ---------------------------------------------------------------- CPU identity

/// The hosted build pretends to be a small SMP machine so the cross-CPU
/// paths stay live in tests.
pub fn cpu_count() -> usize {
    4
}

#[cfg(test)]
pub fn current_cpu() -> usize {
    use std::cell::Cell;

    static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static CPU: Cell<Option<usize>> = const { Cell::new(None) };
    }
    CPU.with(|cell| match cell.get() {
        Some(cpu) => cpu,
        None => {
            let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % MAX_CPU_COUNT;
            cell.set(Some(cpu));
            cpu
        }
    })
}

#[cfg(not(test))]
pub fn current_cpu() -> usize {
    0
}

pub fn relax() {
    core::hint::spin_loop();
}

pub fn idle_wait() {
    core::hint::spin_loop();
}

pub fn halt_all_cpus() -> ! {
    panic!("all CPUs halted");
}

// ------------------------------------------------------------- priority level

static PRIORITY: [AtomicU8; MAX_CPU_COUNT] = [const { AtomicU8::new(0) }; MAX_CPU_COUNT];

pub fn priority_raw() -> u8 {
    PRIORITY[current_cpu()].load(Ordering::Relaxed)
}

pub fn set_priority_raw(level: u8) {
    PRIORITY[current_cpu()].store(level, Ordering::Relaxed);
}

// ----------------------------------------------------------------------- time

static CLOCK: AtomicU64 = AtomicU64::new(0);
static TIMER_PERIOD: AtomicU64 = AtomicU64::new(0);
static TIMER_VECTOR: AtomicU8 = AtomicU8::new(0);

pub fn timestamp() -> u64 {
    CLOCK.load(Ordering::SeqCst)
}

pub fn start_system_timer(period_ns: u64) {
    TIMER_PERIOD.store(period_ns, Ordering::SeqCst);
}

pub fn configure_system_timer(vector: u8) {
    TIMER_VECTOR.store(vector, Ordering::SeqCst);
}

/// Advance the test clock.
pub fn advance_clock(ns: u64) {
    CLOCK.fetch_add(ns, Ordering::SeqCst);
}

pub fn last_timer_period() -> u64 {
    TIMER_PERIOD.load(Ordering::SeqCst)
}

// --------------------------------------------------------------------- memory

#[derive(Default)]
struct SoftSpace {
    pages: BTreeMap<VirtAddr, (PhysAddr, PageFlags)>,
}

static KERNEL_PAGES: SpinLock<BTreeMap<VirtAddr, (PhysAddr, PageFlags)>> =
    SpinLock::new(BTreeMap::new());
static USER_SPACES: SpinLock<BTreeMap<PhysAddr, SoftSpace>> = SpinLock::new(BTreeMap::new());
static NEXT_ROOT: AtomicUsize = AtomicUsize::new(0x0010_0000);
static CURRENT_ROOT: [AtomicUsize; MAX_CPU_COUNT] = [const { AtomicUsize::new(0) }; MAX_CPU_COUNT];
static LOCAL_INVALIDATIONS: AtomicU64 = AtomicU64::new(0);

fn is_kernel_address(va: VirtAddr) -> bool {
    va >= KERNEL_SPACE_BASE
}

fn stored_flags(flags: PageFlags) -> PageFlags {
    let mut stored = flags | PageFlags::PRESENT;
    if flags.contains(PageFlags::READ_ONLY) {
        stored.remove(PageFlags::WRITABLE);
    }
    stored
}

pub fn create_address_space() -> Result<PhysAddr> {
    let root = NEXT_ROOT.fetch_add(PAGE_SIZE, Ordering::SeqCst);
    USER_SPACES.lock().insert(root, SoftSpace::default());
    Ok(root)
}

pub fn destroy_address_space(root: PhysAddr) {
    USER_SPACES.lock().remove(&root);
}

pub fn current_address_space_root() -> PhysAddr {
    CURRENT_ROOT[current_cpu()].load(Ordering::SeqCst)
}

pub fn set_current_address_space(root: PhysAddr) {
    CURRENT_ROOT[current_cpu()].store(root, Ordering::SeqCst);
}

fn with_page_map<R>(
    va: VirtAddr,
    f: impl FnOnce(&mut BTreeMap<VirtAddr, (PhysAddr, PageFlags)>) -> R,
) -> R {
    if is_kernel_address(va) {
        f(&mut KERNEL_PAGES.lock())
    } else {
        let root = current_address_space_root();
        let mut spaces = USER_SPACES.lock();
        f(&mut spaces.entry(root).or_default().pages)
    }
}

pub fn map_page(va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result {
    let page = va & !(PAGE_SIZE - 1);
    with_page_map(page, |pages| {
        if pages.contains_key(&page) {
            return Err(Status::MemoryAlreadyMapped);
        }
        pages.insert(page, (pa & !(PAGE_SIZE - 1), stored_flags(flags)));
        Ok(())
    })
}

pub fn map_range(va: VirtAddr, pa: PhysAddr, size: usize, flags: PageFlags) -> Result {
    let mut offset = 0;
    while offset < size {
        map_page(va + offset, pa + offset, flags)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

pub fn unmap_page(va: VirtAddr) -> Result {
    let page = va & !(PAGE_SIZE - 1);
    with_page_map(page, |pages| {
        pages
            .remove(&page)
            .map(|_| ())
            .ok_or(Status::PageNotPresent)
    })
}

pub fn unmap_range(va: VirtAddr, size: usize) -> Result {
    let mut offset = 0;
    while offset < size {
        unmap_page(va + offset)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

pub fn get_page_flags(va: VirtAddr) -> Result<PageFlags> {
    let page = va & !(PAGE_SIZE - 1);
    with_page_map(page, |pages| {
        pages
            .get(&page)
            .map(|(_, flags)| *flags)
            .ok_or(Status::PageNotPresent)
    })
}

pub fn get_physical(va: VirtAddr) -> Result<PhysAddr> {
    let page = va & !(PAGE_SIZE - 1);
    with_page_map(page, |pages| {
        pages
            .get(&page)
            .map(|(pa, _)| pa + (va & (PAGE_SIZE - 1)))
            .ok_or(Status::PageNotPresent)
    })
}

/// Lock-free variant for the page-fault path; absent pages read as empty
/// flags.
pub fn page_flags_for_fault(va: VirtAddr) -> PageFlags {
    get_page_flags(va).unwrap_or(PageFlags::empty())
}

pub fn invalidate_local(_va: VirtAddr) {
    LOCAL_INVALIDATIONS.fetch_add(1, Ordering::SeqCst);
}

pub fn local_invalidation_count() -> u64 {
    LOCAL_INVALIDATIONS.load(Ordering::SeqCst)
}

pub fn validate_user_buffer(ptr: usize, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    let end = match ptr.checked_add(size) {
        Some(end) => end,
        None => return false,
    };
    ptr > 0 && end <= KERNEL_SPACE_BASE
}

// ------------------------------------------------- mapped-memory byte access

static BACKING: SpinLock<BTreeMap<VirtAddr, alloc::boxed::Box<[u8; PAGE_SIZE]>>> =
    SpinLock::new(BTreeMap::new());

fn backing_page(
    store: &mut BTreeMap<VirtAddr, alloc::boxed::Box<[u8; PAGE_SIZE]>>,
    page: VirtAddr,
) -> &mut [u8; PAGE_SIZE] {
    store
        .entry(page)
        .or_insert_with(|| alloc::boxed::Box::new([0u8; PAGE_SIZE]))
}

/// Store bytes at a mapped kernel virtual address.
///
/// # Safety
/// The range must be mapped writable. The hosted build keeps page contents
/// in a side table instead of touching host memory.
pub unsafe fn write_bytes_at(va: VirtAddr, data: &[u8]) {
    let mut store = BACKING.lock();
    for (index, byte) in data.iter().enumerate() {
        let address = va + index;
        let page = address & !(PAGE_SIZE - 1);
        backing_page(&mut store, page)[address % PAGE_SIZE] = *byte;
    }
}

/// # Safety
/// The range must be mapped.
pub unsafe fn read_bytes_at(va: VirtAddr, buffer: &mut [u8]) {
    let mut store = BACKING.lock();
    for (index, slot) in buffer.iter_mut().enumerate() {
        let address = va + index;
        let page = address & !(PAGE_SIZE - 1);
        *slot = backing_page(&mut store, page)[address % PAGE_SIZE];
    }
}

/// # Safety
/// The range must be mapped writable.
pub unsafe fn fill_zero_at(va: VirtAddr, length: usize) {
    let mut store = BACKING.lock();
    for index in 0..length {
        let address = va + index;
        let page = address & !(PAGE_SIZE - 1);
        backing_page(&mut store, page)[address % PAGE_SIZE] = 0;
    }
}

// ------------------------------------------------------------ IPI / shootdown

static REMOTE_SHOOTDOWNS: AtomicU64 = AtomicU64::new(0);

/// Remote CPUs do not exist here; completion is immediate. The slot
/// bookkeeping the real protocol depends on is tested through
/// [`crate::rtl::AtomicBitmap`].
pub fn send_invalidate(targets: &CpuSet, _root: PhysAddr, _va: VirtAddr, _pages: usize) {
    if targets.count() > 1 {
        REMOTE_SHOOTDOWNS.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn send_invalidate_kernel(_va: VirtAddr, _pages: usize) {
    REMOTE_SHOOTDOWNS.fetch_add(1, Ordering::SeqCst);
}

pub fn send_shutdown_cpus() {}

// ------------------------------------------------------------- IRQ controller

struct HostedIrqs {
    registered: BTreeMap<u32, (u8, InterruptParams)>,
    enabled: BTreeMap<u32, bool>,
    eois: u64,
}

static IRQS: SpinLock<HostedIrqs> = SpinLock::new(HostedIrqs {
    registered: BTreeMap::new(),
    enabled: BTreeMap::new(),
    eois: 0,
});

pub fn irq_register(input: u32, vector: u8, params: InterruptParams) -> Result {
    let mut irqs = IRQS.lock();
    if irqs.registered.contains_key(&input) {
        return Err(Status::AlreadyRegistered);
    }
    irqs.registered.insert(input, (vector, params));
    Ok(())
}

pub fn irq_unregister(input: u32) -> Result {
    let mut irqs = IRQS.lock();
    irqs.enabled.remove(&input);
    irqs.registered
        .remove(&input)
        .map(|_| ())
        .ok_or(Status::NotRegistered)
}

pub fn irq_enable(input: u32) -> Result {
    IRQS.lock().enabled.insert(input, true);
    Ok(())
}

pub fn irq_disable(input: u32) -> Result {
    IRQS.lock().enabled.insert(input, false);
    Ok(())
}

pub fn irq_eoi(_vector: u8) -> Result {
    IRQS.lock().eois += 1;
    Ok(())
}

pub fn irq_is_spurious() -> bool {
    false
}

pub fn resolve_isa_irq(irq: u32) -> u32 {
    irq
}

/// On the hosted build vectors and inputs are decoupled, as with an I/O
/// APIC.
pub fn irq_vector_is_line_bound() -> bool {
    false
}

pub fn vector_for_irq_input(input: u32) -> u32 {
    input
}

pub fn irq_registered_vector(input: u32) -> Option<u8> {
    IRQS.lock().registered.get(&input).map(|(v, _)| *v)
}

pub fn irq_enabled(input: u32) -> bool {
    IRQS.lock().enabled.get(&input).copied().unwrap_or(false)
}

/// Install an IDT gate for the vector; nothing to do here.
pub fn ensure_gate(_vector: u8) {}

// ------------------------------------------------------------------ switching

/// Per-task architecture state.
pub struct TaskData {
    pub address_space: PhysAddr,
    pub entry: TaskEntry,
    pub entry_context: usize,
}

impl TaskData {
    pub fn new(address_space: PhysAddr, entry: TaskEntry, entry_context: usize) -> Result<TaskData> {
        Ok(TaskData {
            address_space,
            entry,
            entry_context,
        })
    }
}

/// No stack is swapped on the hosted build; only the inbound bookkeeping
/// runs, which is what the scheduler contract requires.
pub fn switch_tasks(_old: Option<&Task>, new: &Task) {
    set_current_address_space(new.process.address_space);
    crate::ke::sched::attach_last_task(current_cpu());
}
