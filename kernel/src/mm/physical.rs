//! Pooled physical frame allocator.
//!
//! Two pools: the low pool below 1 MiB for ISA DMA and CPU bootstrap, and
//! the standard pool for everything else. A bitmap tracks 4 KiB frames;
//! allocation finds a contiguous run satisfying size and alignment. No
//! reference counting here.

use crate::ke::SpinLock;
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::rtl::align_up;
use crate::status::{Result, Status};

/// Boundary between the pools.
pub const LOW_POOL_LIMIT: usize = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysPool {
    Standard,
    Low,
}

const LOW_FRAMES: usize = LOW_POOL_LIMIT / PAGE_SIZE;
const LOW_WORDS: usize = LOW_FRAMES / 32;
/// The standard pool covers 1 MiB up to the 4 GiB physical limit.
const STANDARD_SPAN: u64 = 0x1_0000_0000 - LOW_POOL_LIMIT as u64;
const STANDARD_FRAMES: usize = (STANDARD_SPAN / PAGE_SIZE as u64) as usize;
const STANDARD_WORDS: usize = STANDARD_FRAMES.div_ceil(32);

/// Frame-use bitmap over a contiguous physical window. Everything starts
/// out used; the boot code frees what the memory map reports usable.
pub struct FramePool<const WORDS: usize> {
    base: PhysAddr,
    frames: usize,
    used: [u32; WORDS],
}

impl<const WORDS: usize> FramePool<WORDS> {
    pub const fn new(base: PhysAddr, frames: usize) -> FramePool<WORDS> {
        FramePool {
            base,
            frames,
            used: [u32::MAX; WORDS],
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        self.used[frame / 32] & (1 << (frame % 32)) != 0
    }

    fn set_used(&mut self, frame: usize, used: bool) {
        let mask = 1 << (frame % 32);
        if used {
            self.used[frame / 32] |= mask;
        } else {
            self.used[frame / 32] &= !mask;
        }
    }

    /// Mark a physical range used or free. Ranges outside the pool window
    /// are clipped.
    pub fn set_range(&mut self, address: PhysAddr, size: usize, used: bool) {
        let end = address.saturating_add(size);
        let start = address.max(self.base);
        let end = end.min(self.base + self.frames * PAGE_SIZE);
        if start >= end {
            return;
        }
        let mut frame = (start - self.base) / PAGE_SIZE;
        let last = (end - self.base).div_ceil(PAGE_SIZE);
        while frame < last {
            self.set_used(frame, used);
            frame += 1;
        }
    }

    /// Find and claim a contiguous aligned run. Returns the address and the
    /// page-rounded size.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Option<(PhysAddr, usize)> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let count = size / PAGE_SIZE;
        let alignment = alignment.max(PAGE_SIZE);
        if !alignment.is_power_of_two() || count > self.frames {
            return None;
        }

        // First frame index satisfying the alignment, then step by it.
        let step = alignment / PAGE_SIZE;
        let misalign = self.base % alignment;
        let mut frame = if misalign == 0 {
            0
        } else {
            (alignment - misalign) / PAGE_SIZE
        };

        while frame + count <= self.frames {
            let mut run = 0;
            while run < count && !self.is_used(frame + run) {
                run += 1;
            }
            if run == count {
                for f in frame..frame + count {
                    self.set_used(f, true);
                }
                return Some((self.base + frame * PAGE_SIZE, size));
            }
            frame += step;
        }
        None
    }

    pub fn free(&mut self, address: PhysAddr, size: usize) {
        self.set_range(address, size, false);
    }
}

static LOW_POOL: SpinLock<FramePool<LOW_WORDS>> = SpinLock::new(FramePool::new(0, LOW_FRAMES));
static STANDARD_POOL: SpinLock<FramePool<STANDARD_WORDS>> =
    SpinLock::new(FramePool::new(LOW_POOL_LIMIT, STANDARD_FRAMES));

/// Allocate a contiguous physical range.
pub fn allocate(size: usize, alignment: usize, pool: PhysPool) -> Result<(PhysAddr, usize)> {
    let result = match pool {
        PhysPool::Low => LOW_POOL.lock().allocate(size, alignment),
        PhysPool::Standard => STANDARD_POOL.lock().allocate(size, alignment),
    };
    result.ok_or(Status::OutOfResources)
}

/// Return pages to the pool they came from.
pub fn free(address: PhysAddr, size: usize) {
    if address < LOW_POOL_LIMIT {
        LOW_POOL.lock().free(address, size.min(LOW_POOL_LIMIT - address));
        if address + size > LOW_POOL_LIMIT {
            STANDARD_POOL
                .lock()
                .free(LOW_POOL_LIMIT, address + size - LOW_POOL_LIMIT);
        }
    } else {
        STANDARD_POOL.lock().free(address, size);
    }
}

/// Boot-time: report a usable range from the firmware memory map.
pub fn add_usable_range(address: PhysAddr, size: usize) {
    LOW_POOL.lock().set_range(address, size, false);
    STANDARD_POOL.lock().set_range(address, size, false);
}

/// Boot-time: re-reserve a range (kernel image, modules, page tables).
pub fn reserve_range(address: PhysAddr, size: usize) {
    LOW_POOL.lock().set_range(address, size, true);
    STANDARD_POOL.lock().set_range(address, size, true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FramePool<8> {
        // A 1 MiB window at 16 MiB, fully usable.
        let mut pool = FramePool::<8>::new(0x100_0000, 256);
        pool.set_range(0x100_0000, 256 * PAGE_SIZE, false);
        pool
    }

    #[test]
    fn allocates_rounded_contiguous_runs() {
        let mut pool = pool();
        let (a, size_a) = pool.allocate(3 * PAGE_SIZE + 1, PAGE_SIZE).unwrap();
        assert_eq!(a, 0x100_0000);
        assert_eq!(size_a, 4 * PAGE_SIZE);

        let (b, _) = pool.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(b, 0x100_0000 + 4 * PAGE_SIZE);
    }

    #[test]
    fn respects_alignment() {
        let mut pool = pool();
        let (_, _) = pool.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let (aligned, _) = pool.allocate(PAGE_SIZE, 0x1_0000).unwrap();
        assert_eq!(aligned % 0x1_0000, 0);
    }

    #[test]
    fn freed_ranges_are_reused() {
        let mut pool = pool();
        let (a, size) = pool.allocate(8 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let (_b, _) = pool.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        pool.free(a, size);
        let (again, _) = pool.allocate(8 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = pool();
        assert!(pool.allocate(257 * PAGE_SIZE, PAGE_SIZE).is_none());
        let (_, _) = pool.allocate(256 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(pool.allocate(PAGE_SIZE, PAGE_SIZE).is_none());
    }

    #[test]
    fn reserved_holes_are_skipped() {
        let mut pool = pool();
        // Poke a hole at frame 1.
        pool.set_range(0x100_0000 + PAGE_SIZE, PAGE_SIZE, true);
        let (first, _) = pool.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(first, 0x100_0000);
        let (next, _) = pool.allocate(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(next, 0x100_0000 + 2 * PAGE_SIZE);
    }
}
