//! Kernel memory management: physical frames, virtual regions, dynamic
//! mappings, the heap and fixed-size object caches.

pub mod dynmap;
pub mod heap;
pub mod physical;
pub mod region;
pub mod slab;

use bitflags::bitflags;

pub type PhysAddr = usize;
pub type VirtAddr = usize;

pub use crate::config::PAGE_SIZE;

bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// Overrides `WRITABLE`.
        const READ_ONLY = 1 << 5;
        const NON_EXECUTABLE = 1 << 6;
        /// Hint only; the architecture may ignore it.
        const LARGE_PAGE = 1 << 7;
    }
}

/// Page-fault reconciliation decision shared by the architecture handlers.
///
/// A fault may be stale-TLB noise when the tables already hold a mapping
/// satisfying the faulting access: the entry is present while the fault says
/// absent, writable while the fault was a rejected write, or user-accessible
/// while the fault was a rejected user access. The handler then only needs a
/// local invalidation and a retry.
pub fn fault_is_stale_tlb(flags: PageFlags, fault: FaultInfo) -> bool {
    let mut stale = false;
    stale |= flags.contains(PageFlags::PRESENT) && !fault.present;
    stale |= flags.contains(PageFlags::WRITABLE) && fault.write;
    stale |= flags.contains(PageFlags::USER) && fault.user;
    stale
}

/// Decoded page-fault error information.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// The fault was caused by a present-bit violation being clear.
    pub present: bool,
    /// The faulting access was a write.
    pub write: bool,
    /// The faulting access came from user mode.
    pub user: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_tlb_reconciliation_matrix() {
        let mapped_rw = PageFlags::PRESENT | PageFlags::WRITABLE;

        // Fault reports "not present" but the tables have the page: stale.
        assert!(fault_is_stale_tlb(
            mapped_rw,
            FaultInfo {
                present: false,
                write: false,
                user: false
            }
        ));

        // Rejected write on a page the tables say is writable: stale.
        assert!(fault_is_stale_tlb(
            mapped_rw,
            FaultInfo {
                present: true,
                write: true,
                user: false
            }
        ));

        // Write to a genuinely read-only present page: real fault.
        assert!(!fault_is_stale_tlb(
            PageFlags::PRESENT,
            FaultInfo {
                present: true,
                write: true,
                user: false
            }
        ));

        // Access to an unmapped page: real fault.
        assert!(!fault_is_stale_tlb(
            PageFlags::empty(),
            FaultInfo {
                present: false,
                write: false,
                user: false
            }
        ));
    }
}
