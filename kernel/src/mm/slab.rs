//! Fixed-size object caches over the kernel heap.
//!
//! Hot-path objects (Request Packets above all) are recycled through a
//! bounded per-type cache instead of hitting the heap allocator on every
//! create/free cycle. A recycled object keeps its previous contents; the
//! owner resets it on reuse.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ke::SpinLock;

pub struct ObjectCache<T> {
    free: SpinLock<Vec<Arc<T>>>,
    capacity: usize,
}

impl<T> ObjectCache<T> {
    pub const fn new(capacity: usize) -> ObjectCache<T> {
        ObjectCache {
            free: SpinLock::new(Vec::new()),
            capacity,
        }
    }

    /// Take a cached object or build a fresh one.
    pub fn take_or(&self, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(cached) = self.free.lock().pop() {
            cached
        } else {
            Arc::new(make())
        }
    }

    /// Return an object to the cache. Objects that are still shared or that
    /// exceed the cache bound are simply dropped.
    pub fn put(&self, object: Arc<T>) {
        if Arc::strong_count(&object) != 1 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(object);
        }
    }

    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_are_recycled() {
        let cache: ObjectCache<u32> = ObjectCache::new(8);
        let first = cache.take_or(|| 7);
        let address = Arc::as_ptr(&first) as usize;
        cache.put(first);
        assert_eq!(cache.cached(), 1);

        let again = cache.take_or(|| 9);
        assert_eq!(Arc::as_ptr(&again) as usize, address);
        // Recycled, so the old value is still there.
        assert_eq!(*again, 7);
    }

    #[test]
    fn shared_objects_are_not_cached() {
        let cache: ObjectCache<u32> = ObjectCache::new(8);
        let object = cache.take_or(|| 1);
        let second_ref = Arc::clone(&object);
        cache.put(object);
        assert_eq!(cache.cached(), 0);
        drop(second_ref);
    }

    #[test]
    fn cache_is_bounded() {
        let cache: ObjectCache<u32> = ObjectCache::new(2);
        for i in 0..4 {
            cache.put(Arc::new(i));
        }
        assert_eq!(cache.cached(), 2);
    }
}
