//! Virtual region allocator.
//!
//! Each disjoint kernel region (driver images, dynamic mappings) is managed
//! as an interval map of used ranges: allocation is a first-fit gap scan,
//! freeing cuts the range back out, so adjacent free space coalesces by
//! construction.

use alloc::collections::BTreeMap;

use nodit::interval::ii;
use nodit::{Interval, NoditMap};

use crate::mm::{VirtAddr, PAGE_SIZE};
use crate::rtl::align_up;

pub struct RegionAllocator {
    bounds: Interval<u64>,
    used: NoditMap<u64, Interval<u64>, ()>,
    sizes: BTreeMap<u64, u64>,
}

impl RegionAllocator {
    pub fn new(base: VirtAddr, size: usize) -> RegionAllocator {
        RegionAllocator {
            bounds: ii(base as u64, (base + size - 1) as u64),
            used: NoditMap::new(),
            sizes: BTreeMap::new(),
        }
    }

    /// First-fit allocation of a page-rounded range.
    pub fn allocate(&mut self, size: usize) -> Option<VirtAddr> {
        let size = align_up(size.max(1), PAGE_SIZE) as u64;
        let gap = self
            .used
            .gaps_trimmed(&self.bounds)
            .find(|gap| gap.end() - gap.start() + 1 >= size)?;
        let start = *gap.start();
        self.used
            .insert_strict(ii(start, start + size - 1), ())
            .ok()?;
        self.sizes.insert(start, size);
        Some(start as VirtAddr)
    }

    /// Free the allocation starting at `address`; returns its size.
    pub fn free(&mut self, address: VirtAddr) -> Option<usize> {
        let size = self.sizes.remove(&(address as u64))?;
        let _ = self
            .used
            .cut(&ii(address as u64, address as u64 + size - 1));
        Some(size as usize)
    }

    /// Size of the allocation containing `address`, with its base.
    pub fn lookup(&self, address: VirtAddr) -> Option<(VirtAddr, usize)> {
        let (base, size) = self.sizes.range(..=address as u64).next_back()?;
        if address as u64 >= *base && (address as u64) < *base + *size {
            Some((*base as VirtAddr, *size as usize))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0xE800_0000;

    #[test]
    fn first_fit_and_coalescing() {
        let mut region = RegionAllocator::new(BASE, 0x10_0000);
        let a = region.allocate(0x4000).unwrap();
        let b = region.allocate(0x2000).unwrap();
        let c = region.allocate(0x1000).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 0x4000);
        assert_eq!(c, BASE + 0x6000);

        // Free the first two; the hole coalesces and is reused first-fit.
        assert_eq!(region.free(a), Some(0x4000));
        assert_eq!(region.free(b), Some(0x2000));
        let d = region.allocate(0x6000).unwrap();
        assert_eq!(d, BASE);
    }

    #[test]
    fn sizes_round_up_to_pages() {
        let mut region = RegionAllocator::new(BASE, 0x10_0000);
        let a = region.allocate(1).unwrap();
        let b = region.allocate(1).unwrap();
        assert_eq!(b - a, PAGE_SIZE);
    }

    #[test]
    fn exhaustion_and_double_free() {
        let mut region = RegionAllocator::new(BASE, 0x2000);
        let a = region.allocate(0x2000).unwrap();
        assert!(region.allocate(0x1000).is_none());
        assert_eq!(region.free(a), Some(0x2000));
        assert_eq!(region.free(a), None);
    }

    #[test]
    fn lookup_resolves_interior_addresses() {
        let mut region = RegionAllocator::new(BASE, 0x10_0000);
        let a = region.allocate(0x3000).unwrap();
        assert_eq!(region.lookup(a + 0x1234), Some((a, 0x3000)));
        assert_eq!(region.lookup(a + 0x3000), None);
    }
}
