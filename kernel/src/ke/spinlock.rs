//! Priority-disciplined spinlock.
//!
//! Acquisition raises the CPU to spinlock level first, so the holder cannot
//! be preempted by the dispatcher while the lock is held. Holding a spinlock
//! across any suspension point is forbidden.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal;
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PrioGuard, PriorityLevel};

pub struct SpinLock<T> {
    word: AtomicU32,
    /// Holding CPU + 1, 0 when free. Catches same-CPU reacquisition, which
    /// can never succeed.
    owner: AtomicU32,
    value: UnsafeCell<T>,
}

// The guard hands out &mut T only while the lock word is held.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> SpinLock<T> {
        SpinLock {
            word: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire at spinlock level.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock_at(PriorityLevel::SPINLOCK)
    }

    /// Acquire raising only to DPC level, for regions where the spinlock
    /// level is already in effect through other means.
    pub fn lock_at_dpc(&self) -> SpinLockGuard<'_, T> {
        self.lock_at(PriorityLevel::DPC)
    }

    fn lock_at(&self, level: PriorityLevel) -> SpinLockGuard<'_, T> {
        // Callers already above the target level keep theirs.
        let prio = prio::raise(level.max(prio::current()));
        let cpu_tag = hal::current_cpu() as u32 + 1;

        if self.owner.load(Ordering::Relaxed) == cpu_tag {
            // This CPU already holds the lock and would spin on itself
            // forever.
            panic_ex(
                PanicCode::BusyMutexAcquired,
                [self as *const _ as usize, 0, 0, 0],
            );
        }

        loop {
            if self.word.swap(1, Ordering::SeqCst) == 0 {
                break;
            }
            // Spin on plain loads to keep the bus quiet, retry the exchange
            // once the lock looks free.
            while self.word.load(Ordering::Relaxed) != 0 {
                hal::relax();
            }
        }
        self.owner.store(cpu_tag, Ordering::Relaxed);

        SpinLockGuard {
            lock: self,
            _prio: prio,
        }
    }

    /// Access without locking. Only sound before the secondary CPUs and the
    /// scheduler are running.
    pub unsafe fn force_get_mut(&self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _prio: PrioGuard,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Relaxed);
        if self.lock.word.swap(0, Ordering::SeqCst) == 0 {
            panic_ex(
                PanicCode::UnacquiredMutexReleased,
                [self.lock as *const _ as usize, 0, 0, 0],
            );
        }
        // The priority guard field restores the previous level afterwards.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_raises_to_spinlock_level() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            assert_eq!(prio::current(), PriorityLevel::SPINLOCK);
            *guard += 1;
        }
        assert_eq!(prio::current(), PriorityLevel::PASSIVE);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn dpc_level_lock_keeps_dpc() {
        let lock = SpinLock::new(());
        let _guard = lock.lock_at_dpc();
        assert_eq!(prio::current(), PriorityLevel::DPC);
    }

    #[test]
    #[should_panic(expected = "BusyMutexAcquired")]
    fn relocking_on_the_same_cpu_panics() {
        let lock = SpinLock::new(());
        let _held = lock.lock();
        let _deadlock = lock.lock();
    }
}
