//! Dynamic kernel mappings.
//!
//! A dedicated virtual region for transient views of arbitrary physical
//! memory (foreign page tables, MMIO, loaded files). Mapping and unmapping
//! hold spinlocks only; never call these from a path that may yield while
//! holding the result's lifetime hostage.

use spin::Lazy;

use crate::config::{DYNAMIC_SPACE_BASE, DYNAMIC_SPACE_SIZE};
use crate::hal;
use crate::ke::SpinLock;
use crate::mm::region::RegionAllocator;
use crate::mm::{PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::rtl::{align_down, align_up};
use crate::status::{Result, Status};

static DYNAMIC: Lazy<SpinLock<RegionAllocator>> =
    Lazy::new(|| SpinLock::new(RegionAllocator::new(DYNAMIC_SPACE_BASE, DYNAMIC_SPACE_SIZE)));

/// Map a physical range into the dynamic region. The returned pointer
/// preserves the sub-page offset of `address`.
pub fn map_dynamic(address: PhysAddr, size: usize, flags: PageFlags) -> Result<VirtAddr> {
    if size == 0 {
        return Err(Status::BadParameter);
    }
    let offset = address % PAGE_SIZE;
    let base = address - offset;
    let full_size = align_up(size + offset, PAGE_SIZE);

    let va = DYNAMIC
        .lock()
        .allocate(full_size)
        .ok_or(Status::OutOfResources)?;
    if let Err(e) = hal::map_range(va, base, full_size, flags | PageFlags::PRESENT) {
        DYNAMIC.lock().free(va);
        return Err(e);
    }
    Ok(va + offset)
}

/// Undo [`map_dynamic`]. Accepts any address inside the mapping.
pub fn unmap_dynamic(address: VirtAddr) -> Result {
    let base = align_down(address, PAGE_SIZE);
    let (start, size) = {
        let mut region = DYNAMIC.lock();
        let (start, _) = region.lookup(base).ok_or(Status::MemoryAlreadyUnmapped)?;
        let size = region.free(start).ok_or(Status::MemoryAlreadyUnmapped)?;
        (start, size)
    };
    hal::unmap_range(start, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_offset_and_translation() {
        let pa = 0x0200_0123;
        let va = map_dynamic(pa, 0x1800, PageFlags::WRITABLE).unwrap();
        assert_eq!(va % PAGE_SIZE, 0x123);
        assert_eq!(hal::get_physical(va).unwrap(), pa);
        // Spans two pages despite the small size, because of the offset.
        assert_eq!(hal::get_physical(va + 0x1000).unwrap(), pa + 0x1000);

        unmap_dynamic(va).unwrap();
        assert_eq!(hal::get_physical(va), Err(Status::PageNotPresent));
        assert_eq!(unmap_dynamic(va), Err(Status::MemoryAlreadyUnmapped));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(
            map_dynamic(0x1000, 0, PageFlags::empty()),
            Err(Status::BadParameter)
        );
    }
}
