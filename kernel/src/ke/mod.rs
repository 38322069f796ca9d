//! Kernel core: priority levels, locking, tasks, scheduling and deferred
//! work.

pub mod dpc;
pub mod mutex;
pub mod panic;
pub mod prio;
pub mod sched;
pub mod sleep;
pub mod spinlock;
pub mod task;
pub mod worker;

pub use mutex::{Mutex, RwLock, Semaphore};
pub use panic::{panic, panic_ex, PanicCode};
pub use prio::{PrioGuard, PriorityLevel};
pub use spinlock::{SpinLock, SpinLockGuard};

#[cfg(test)]
pub mod test_support {
    //! Tests that touch the shared scheduler state (run queues, timed-wait
    //! queue, sleep list, per-CPU slots) serialize on this lock.

    pub static SCHED: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub fn lock() -> std::sync::MutexGuard<'static, ()> {
        SCHED.lock().unwrap_or_else(|e| e.into_inner())
    }
}
