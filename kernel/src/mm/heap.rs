//! Kernel heap.
//!
//! `talc` backs the global allocator. The heap region is claimed lazily in
//! 4 MiB chunks: on out-of-memory the handler grabs physical frames, maps
//! them at the next free spot of the heap window and hands the span to the
//! allocator. Host builds use the host allocator instead.

#[cfg(target_arch = "x86")]
pub use backing::init;

#[cfg(target_arch = "x86")]
mod backing {
    use core::alloc::Layout;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use talc::{OomHandler, Span, Talc, Talck};

    use crate::config::{HEAP_BASE, HEAP_SIZE, PAGE_SIZE};
    use crate::hal;
    use crate::ke::panic::{panic_ex, PanicCode};
    use crate::mm::physical::{self, PhysPool};
    use crate::mm::PageFlags;

    const CLAIM_CHUNK: usize = 0x40_0000;

    static NEXT_CLAIM: AtomicUsize = AtomicUsize::new(HEAP_BASE);

    pub struct HeapExtend;

    fn claim_chunk(talc: &mut Talc<HeapExtend>) -> Result<(), ()> {
        let start = NEXT_CLAIM.fetch_add(CLAIM_CHUNK, Ordering::SeqCst);
        if start + CLAIM_CHUNK > HEAP_BASE + HEAP_SIZE {
            return Err(());
        }
        let (pa, _) = physical::allocate(CLAIM_CHUNK, PAGE_SIZE, PhysPool::Standard)
            .map_err(|_| ())?;
        hal::map_range(start, pa, CLAIM_CHUNK, PageFlags::WRITABLE).map_err(|_| ())?;
        unsafe {
            talc.claim(Span::from_base_size(start as *mut u8, CLAIM_CHUNK))
                .map(|_| ())
                .map_err(|_| ())
        }
    }

    impl OomHandler for HeapExtend {
        fn handle_oom(talc: &mut Talc<HeapExtend>, _layout: Layout) -> Result<(), ()> {
            claim_chunk(talc)
        }
    }

    #[global_allocator]
    static ALLOCATOR: Talck<spin::Mutex<()>, HeapExtend> = Talck::new(Talc::new(HeapExtend));

    /// Claim the first heap chunk eagerly. Called once the physical
    /// allocator knows the memory map.
    pub fn init() {
        if claim_chunk(&mut ALLOCATOR.lock()).is_err() {
            panic_ex(PanicCode::BootFailure, [HEAP_BASE, 0, 0, 0]);
        }
    }
}
