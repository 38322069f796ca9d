//! i686 implementation of the architecture contract.

pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod ioapic;
pub mod ipi;
pub mod irq;
pub mod lapic;
pub mod memory;
pub mod pic;
pub mod serial;
pub mod smp;
pub mod task;
pub mod time;

use crate::it::InterruptParams;
use crate::ke::task::Task;
use crate::mm::{PageFlags, PhysAddr, VirtAddr};
use crate::rtl::CpuSet;
use crate::status::Result;

pub use task::TaskData;

pub fn current_cpu() -> usize {
    cpu::current_cpu()
}

pub fn cpu_count() -> usize {
    cpu::cpu_count()
}

pub fn relax() {
    cpu::relax()
}

pub fn idle_wait() {
    cpu::idle_wait()
}

/// Stop the machine: silence the other CPUs, then halt this one.
pub fn halt_all_cpus() -> ! {
    ipi::send_shutdown_cpus();
    cpu::halt_forever()
}

pub fn priority_raw() -> u8 {
    cpu::priority_raw()
}

pub fn set_priority_raw(level: u8) {
    cpu::set_priority_raw(level)
}

pub fn timestamp() -> u64 {
    time::timestamp()
}

pub fn start_system_timer(period_ns: u64) {
    lapic::start_timer(period_ns)
}

pub fn configure_system_timer(vector: u8) {
    lapic::configure_timer(vector)
}

pub fn map_page(va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result {
    memory::map_page(va, pa, flags)
}

pub fn map_range(va: VirtAddr, pa: PhysAddr, size: usize, flags: PageFlags) -> Result {
    memory::map_range(va, pa, size, flags)
}

pub fn unmap_page(va: VirtAddr) -> Result {
    memory::unmap_page(va)
}

pub fn unmap_range(va: VirtAddr, size: usize) -> Result {
    memory::unmap_range(va, size)
}

pub fn get_page_flags(va: VirtAddr) -> Result<PageFlags> {
    memory::get_page_flags(va)
}

pub fn get_physical(va: VirtAddr) -> Result<PhysAddr> {
    memory::get_physical(va)
}

pub fn page_flags_for_fault(va: VirtAddr) -> PageFlags {
    memory::page_flags_for_fault(va)
}

pub fn invalidate_local(va: VirtAddr) {
    memory::invalidate_local(va)
}

pub fn create_address_space() -> Result<PhysAddr> {
    memory::create_address_space()
}

pub fn destroy_address_space(root: PhysAddr) {
    memory::destroy_address_space(root)
}

pub fn current_address_space_root() -> PhysAddr {
    memory::current_address_space_root()
}

pub fn validate_user_buffer(ptr: usize, size: usize) -> bool {
    memory::validate_user_buffer(ptr, size)
}

/// # Safety
/// The range must be mapped with the required permissions.
pub unsafe fn write_bytes_at(va: VirtAddr, data: &[u8]) {
    unsafe { memory::write_bytes_at(va, data) }
}

/// # Safety
/// The range must be mapped.
pub unsafe fn read_bytes_at(va: VirtAddr, buffer: &mut [u8]) {
    unsafe { memory::read_bytes_at(va, buffer) }
}

/// # Safety
/// The range must be mapped writable.
pub unsafe fn fill_zero_at(va: VirtAddr, length: usize) {
    unsafe { memory::fill_zero_at(va, length) }
}

pub fn send_invalidate(targets: &CpuSet, root: PhysAddr, va: VirtAddr, pages: usize) {
    ipi::send_invalidate(targets, root, va, pages)
}

pub fn send_invalidate_kernel(va: VirtAddr, pages: usize) {
    ipi::send_invalidate_kernel(va, pages)
}

pub fn send_shutdown_cpus() {
    ipi::send_shutdown_cpus()
}

pub fn irq_register(input: u32, vector: u8, params: InterruptParams) -> Result {
    irq::irq_register(input, vector, params)
}

pub fn irq_unregister(input: u32) -> Result {
    irq::irq_unregister(input)
}

pub fn irq_enable(input: u32) -> Result {
    irq::irq_enable(input)
}

pub fn irq_disable(input: u32) -> Result {
    irq::irq_disable(input)
}

pub fn irq_eoi(vector: u8) -> Result {
    irq::irq_eoi(vector)
}

pub fn irq_is_spurious() -> bool {
    irq::irq_is_spurious()
}

pub fn resolve_isa_irq(input: u32) -> u32 {
    irq::resolve_isa_irq(input)
}

pub fn irq_vector_is_line_bound() -> bool {
    irq::irq_vector_is_line_bound()
}

pub fn vector_for_irq_input(input: u32) -> u32 {
    irq::vector_for_irq_input(input)
}

pub fn ensure_gate(vector: u8) {
    idt::ensure_gate(vector, false)
}

pub fn switch_tasks(old: Option<&Task>, new: &Task) {
    task::switch_tasks(old, new)
}
