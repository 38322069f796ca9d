//! Two-level page tables with the self-referencing directory.
//!
//! The last directory entry points at the directory itself, so the current
//! tables are always visible: the directory at `0xFFFFF000`, all page
//! tables as one window from `0xFFC00000`. The kernel half of every
//! directory is shared; the bootstrap code pre-creates all kernel page
//! tables so nothing ever has to propagate a kernel table creation across
//! CPUs.

use x86::controlregs;
use x86::tlb;

use crate::config::{KERNEL_SPACE_BASE, PAGE_SIZE};
use crate::ke::{sched, SpinLock};
use crate::mm::physical::{self, PhysPool};
use crate::mm::{dynmap, PageFlags, PhysAddr, VirtAddr};
use crate::status::{Result, Status};

const PAGE_DIRECTORY_ADDRESS: usize = 0xFFFF_F000;
const PAGE_TABLE_WINDOW: usize = 0xFFC0_0000;
const ENTRY_COUNT: usize = 1024;

const PTE_PRESENT: u32 = 1 << 0;
const PTE_WRITABLE: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;
const PTE_WRITE_THROUGH: u32 = 1 << 3;
const PTE_CACHE_DISABLE: u32 = 1 << 4;

static KERNEL_MEMORY_LOCK: SpinLock<()> = SpinLock::new(());

fn directory() -> *mut u32 {
    PAGE_DIRECTORY_ADDRESS as *mut u32
}

fn table_entry(va: VirtAddr) -> *mut u32 {
    (PAGE_TABLE_WINDOW + (va >> 12) * 4) as *mut u32
}

fn directory_index(va: VirtAddr) -> usize {
    va >> 22
}

fn is_kernel_address(va: VirtAddr) -> bool {
    va >= KERNEL_SPACE_BASE
}

fn pte_from_flags(flags: PageFlags) -> u32 {
    let mut pte = PTE_PRESENT;
    if flags.contains(PageFlags::WRITABLE) && !flags.contains(PageFlags::READ_ONLY) {
        pte |= PTE_WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        pte |= PTE_USER;
    }
    if flags.contains(PageFlags::WRITE_THROUGH) {
        pte |= PTE_WRITE_THROUGH;
    }
    if flags.contains(PageFlags::CACHE_DISABLE) {
        pte |= PTE_CACHE_DISABLE;
    }
    pte
}

fn flags_from_pte(pte: u32) -> PageFlags {
    let mut flags = PageFlags::empty();
    if pte & PTE_PRESENT != 0 {
        flags |= PageFlags::PRESENT;
    }
    if pte & PTE_WRITABLE != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if pte & PTE_USER != 0 {
        flags |= PageFlags::USER;
    }
    if pte & PTE_WRITE_THROUGH != 0 {
        flags |= PageFlags::WRITE_THROUGH;
    }
    if pte & PTE_CACHE_DISABLE != 0 {
        flags |= PageFlags::CACHE_DISABLE;
    }
    flags
}

/// Take the lock covering the half of the address space `va` is in: kernel
/// mappings share one lock, user mappings use the owning process's.
fn with_memory_lock<R>(va: VirtAddr, f: impl FnOnce() -> R) -> R {
    if is_kernel_address(va) {
        let _guard = KERNEL_MEMORY_LOCK.lock();
        f()
    } else {
        match sched::current_task() {
            Some(task) => {
                let _guard = task.process.user_memory_lock.lock();
                f()
            }
            None => {
                let _guard = KERNEL_MEMORY_LOCK.lock();
                f()
            }
        }
    }
}

fn map_page_locked(va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result {
    let va = va & !(PAGE_SIZE - 1);
    unsafe {
        let dir_entry = directory().add(directory_index(va));
        if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
            // Create the page table for this 4 MiB slot.
            let (table_pa, _) = physical::allocate(PAGE_SIZE, PAGE_SIZE, PhysPool::Standard)?;
            let mut dir_flags = PTE_PRESENT | PTE_WRITABLE;
            if flags.contains(PageFlags::USER) {
                dir_flags |= PTE_USER;
            }
            core::ptr::write_volatile(dir_entry, table_pa as u32 | dir_flags);
            let window = table_entry(va & !0x3F_FFFF);
            tlb::flush(window as usize);
            core::ptr::write_bytes(window, 0, ENTRY_COUNT);
        }

        let entry = table_entry(va);
        if core::ptr::read_volatile(entry) & PTE_PRESENT != 0 {
            return Err(Status::MemoryAlreadyMapped);
        }
        core::ptr::write_volatile(entry, (pa as u32 & 0xFFFF_F000) | pte_from_flags(flags));
        tlb::flush(va);
    }
    Ok(())
}

pub fn map_page(va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result {
    with_memory_lock(va, || map_page_locked(va, pa, flags))
}

pub fn map_range(va: VirtAddr, pa: PhysAddr, size: usize, flags: PageFlags) -> Result {
    with_memory_lock(va, || {
        let mut offset = 0;
        while offset < size {
            map_page_locked(va + offset, pa + offset, flags)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    })
}

fn unmap_page_locked(va: VirtAddr) -> Result {
    let va = va & !(PAGE_SIZE - 1);
    unsafe {
        let dir_entry = directory().add(directory_index(va));
        if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        let entry = table_entry(va);
        if core::ptr::read_volatile(entry) & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        core::ptr::write_volatile(entry, 0);
        tlb::flush(va);
    }
    Ok(())
}

fn shoot_down(va: VirtAddr, pages: usize) {
    if is_kernel_address(va) {
        super::ipi::send_invalidate_kernel(va, pages);
    } else if let Some(task) = sched::current_task() {
        let affinity = task.sched.lock().affinity;
        super::ipi::send_invalidate(&affinity, task.process.address_space, va, pages);
    }
}

pub fn unmap_page(va: VirtAddr) -> Result {
    with_memory_lock(va, || {
        unmap_page_locked(va)?;
        shoot_down(va & !(PAGE_SIZE - 1), 1);
        Ok(())
    })
}

pub fn unmap_range(va: VirtAddr, size: usize) -> Result {
    with_memory_lock(va, || {
        let mut offset = 0;
        while offset < size {
            unmap_page_locked(va + offset)?;
            offset += PAGE_SIZE;
        }
        shoot_down(va & !(PAGE_SIZE - 1), size.div_ceil(PAGE_SIZE));
        Ok(())
    })
}

pub fn get_page_flags(va: VirtAddr) -> Result<PageFlags> {
    with_memory_lock(va, || unsafe {
        let dir_entry = directory().add(directory_index(va));
        if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        let pte = core::ptr::read_volatile(table_entry(va));
        if pte & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        Ok(flags_from_pte(pte))
    })
}

pub fn get_physical(va: VirtAddr) -> Result<PhysAddr> {
    with_memory_lock(va, || unsafe {
        let dir_entry = directory().add(directory_index(va));
        if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        let pte = core::ptr::read_volatile(table_entry(va));
        if pte & PTE_PRESENT == 0 {
            return Err(Status::PageNotPresent);
        }
        Ok((pte as usize & !0xFFF) + (va & 0xFFF))
    })
}

/// Lock-free flag peek for the page-fault handler; absent reads as empty.
pub fn page_flags_for_fault(va: VirtAddr) -> PageFlags {
    unsafe {
        let dir_entry = directory().add(directory_index(va));
        if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
            return PageFlags::empty();
        }
        flags_from_pte(core::ptr::read_volatile(table_entry(va)))
    }
}

pub fn invalidate_local(va: VirtAddr) {
    unsafe { tlb::flush(va) };
}

/// Clone the kernel half of the current directory into a fresh root and
/// install its self-reference.
pub fn create_address_space() -> Result<PhysAddr> {
    let (root, _) = physical::allocate(PAGE_SIZE, PAGE_SIZE, PhysPool::Standard)?;

    let window = dynmap::map_dynamic(root, PAGE_SIZE, PageFlags::WRITABLE)?;
    unsafe {
        let new_directory = window as *mut u32;
        core::ptr::write_bytes(new_directory, 0, ENTRY_COUNT);

        let kernel_start = directory_index(KERNEL_SPACE_BASE);
        for index in kernel_start..ENTRY_COUNT - 1 {
            let entry = core::ptr::read_volatile(directory().add(index));
            core::ptr::write_volatile(new_directory.add(index), entry);
        }
        core::ptr::write_volatile(
            new_directory.add(ENTRY_COUNT - 1),
            root as u32 | PTE_PRESENT | PTE_WRITABLE,
        );
    }
    dynmap::unmap_dynamic(window)?;
    Ok(root)
}

/// Free only the root page; the caller has already torn down the user
/// mappings it owns.
pub fn destroy_address_space(root: PhysAddr) {
    if root != 0 {
        physical::free(root, PAGE_SIZE);
    }
}

pub fn current_address_space_root() -> PhysAddr {
    unsafe { controlregs::cr3() as PhysAddr }
}

/// Pre-create every kernel page table so the kernel half stays coherent
/// across address spaces by construction.
pub fn init_kernel_tables() -> Result {
    let _guard = KERNEL_MEMORY_LOCK.lock();
    unsafe {
        let mut va = KERNEL_SPACE_BASE;
        while va < PAGE_TABLE_WINDOW {
            let dir_entry = directory().add(directory_index(va));
            if core::ptr::read_volatile(dir_entry) & PTE_PRESENT == 0 {
                let (table_pa, _) = physical::allocate(PAGE_SIZE, PAGE_SIZE, PhysPool::Standard)?;
                core::ptr::write_volatile(dir_entry, table_pa as u32 | PTE_PRESENT | PTE_WRITABLE);
                let window = table_entry(va);
                tlb::flush(window as usize);
                core::ptr::write_bytes(window, 0, ENTRY_COUNT);
            }
            va += PAGE_SIZE * ENTRY_COUNT;
        }
    }
    Ok(())
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

/// Raw byte access to mapped kernel memory.
///
/// # Safety
/// The range must be mapped with the required permissions.
pub unsafe fn write_bytes_at(va: VirtAddr, data: &[u8]) {
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), va as *mut u8, data.len());
    }
}

/// # Safety
/// The range must be mapped.
pub unsafe fn read_bytes_at(va: VirtAddr, buffer: &mut [u8]) {
    unsafe {
        core::ptr::copy_nonoverlapping(va as *const u8, buffer.as_mut_ptr(), buffer.len());
    }
}

/// # Safety
/// The range must be mapped writable.
pub unsafe fn fill_zero_at(va: VirtAddr, length: usize) {
    unsafe {
        core::ptr::write_bytes(va as *mut u8, 0, length);
    }
}

/// Decide whether a page fault is stale-TLB noise; used by the exception
/// path before it declares the fault fatal.
pub fn reconcile_page_fault(va: VirtAddr, error_code: u32) -> bool {
    let flags = page_flags_for_fault(va);
    let fault = crate::mm::FaultInfo {
        present: error_code & 1 != 0,
        write: error_code & 2 != 0,
        user: error_code & 4 != 0,
    };
    if crate::mm::fault_is_stale_tlb(flags, fault) {
        invalidate_local(va);
        true
    } else {
        false
    }
}

/// Whether the faulting context was user mode, for signal routing.
pub fn fault_was_user_mode(error_code: u32) -> bool {
    error_code & 4 != 0
}

/// Switch the CPU to another page-table root.
///
/// # Safety
/// The root must be a live address space with the kernel half intact.
pub unsafe fn switch_address_space(root: PhysAddr) {
    unsafe {
        if controlregs::cr3() as usize != root {
            controlregs::cr3_write(root as u64);
        }
    }
}

const _: () = {
    // The self-reference exposes the directory as the last page of the
    // table window.
    assert!(PAGE_TABLE_WINDOW + (ENTRY_COUNT - 1) * PAGE_SIZE == PAGE_DIRECTORY_ADDRESS);
    assert!(KERNEL_SPACE_BASE % (PAGE_SIZE * ENTRY_COUNT) == 0);
};
