//! Timed sleep.
//!
//! Sleeping tasks sit on one global list sorted earliest deadline first; the
//! scheduler calls [`refresh`] on every decision and wakes everything whose
//! deadline has passed.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::hal;
use crate::ke::task::{BlockReason, Task};
use crate::ke::{sched, SpinLock};
use crate::ob::Lockable;
use crate::status::Result;

static SLEEPING: SpinLock<VecDeque<Arc<Task>>> = SpinLock::new(VecDeque::new());

/// Put a task to sleep for at least `ns` nanoseconds.
pub fn put_task_to_sleep(task: &Arc<Task>, ns: u64) -> Result {
    let deadline = hal::timestamp() + ns;
    sched::block(task, BlockReason::TimedSleep);

    {
        let mut list = SLEEPING.lock();
        {
            let mut sched_state = task.lock_object();
            sched_state.block.timeout_until = deadline;
            sched_state.block.on_sleep_queue = true;
        }
        let position = list
            .iter()
            .position(|t| t.lock_object().block.timeout_until > deadline)
            .unwrap_or(list.len());
        list.insert(position, Arc::clone(task));
    }

    let is_current = sched::current_task()
        .map(|current| Arc::ptr_eq(&current, task))
        .unwrap_or(false);
    if is_current {
        sched::yield_now();
    }
    Ok(())
}

/// Sleep the calling task.
pub fn sleep(ns: u64) -> Result {
    match sched::current_task() {
        Some(task) => put_task_to_sleep(&task, ns),
        None => Ok(()),
    }
}

/// Busy wait without giving up the CPU. For sub-tick delays only.
pub fn delay(ns: u64) {
    let end = hal::timestamp() + ns;
    while hal::timestamp() < end {
        hal::relax();
    }
}

/// Wake every sleeper whose deadline has passed.
pub fn refresh() {
    let now = hal::timestamp();
    let mut expired = alloc::vec::Vec::new();
    {
        let mut list = SLEEPING.lock();
        while let Some(head) = list.front() {
            let mut sched_state = head.lock_object();
            if sched_state.block.timeout_until > now {
                break;
            }
            sched_state.block.timeout_until = 0;
            sched_state.block.on_sleep_queue = false;
            drop(sched_state);
            expired.push(list.pop_front().unwrap());
        }
    }
    for task in expired {
        sched::unblock(&task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::task::{self, PrivilegeLevel, TaskState};
    use crate::ke::test_support;

    fn noop(_: usize) {}

    fn new_task(name: &str) -> Arc<Task> {
        task::create_process_raw(name, None, PrivilegeLevel::Kernel, noop, 0).unwrap()
    }

    #[test]
    fn sleeper_is_not_woken_before_its_deadline() {
        let _serial = test_support::lock();
        let task = new_task("dozer");
        {
            // Not running anywhere, so the waiting state applies directly.
            let mut sched_state = task.lock_object();
            sched_state.state = TaskState::Waiting;
        }

        put_task_to_sleep(&task, 5_000_000).unwrap();
        assert_eq!(task.lock_object().state, TaskState::Waiting);

        hal::advance_clock(1_000_000);
        refresh();
        assert_eq!(task.lock_object().state, TaskState::Waiting);

        // Lower bound: exactly at the deadline the task becomes ready.
        hal::advance_clock(4_000_000);
        refresh();
        {
            let sched_state = task.lock_object();
            assert_eq!(sched_state.state, TaskState::ReadyToRun);
            assert!(!sched_state.block.on_sleep_queue);
            assert_eq!(sched_state.block.timeout_until, 0);
        }

        sched::testing::remove_from_ready(&task);
        task::destroy_tcb(&task);
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let _serial = test_support::lock();
        let late = new_task("late");
        let early = new_task("early");
        for t in [&late, &early] {
            t.lock_object().state = TaskState::Waiting;
        }

        put_task_to_sleep(&late, 20_000_000).unwrap();
        put_task_to_sleep(&early, 2_000_000).unwrap();

        hal::advance_clock(2_000_000);
        refresh();
        assert_eq!(early.lock_object().state, TaskState::ReadyToRun);
        assert_eq!(late.lock_object().state, TaskState::Waiting);

        hal::advance_clock(18_000_000);
        refresh();
        assert_eq!(late.lock_object().state, TaskState::ReadyToRun);

        for t in [&late, &early] {
            sched::testing::remove_from_ready(t);
            task::destroy_tcb(t);
        }
    }

    #[test]
    fn delay_busy_waits_on_the_clock() {
        let start = hal::timestamp();
        // The hosted clock only moves when advanced; spawn the advance from
        // another thread so delay() has something to chew on.
        let handle = std::thread::spawn(|| hal::advance_clock(1000));
        delay(1000);
        handle.join().unwrap();
        assert!(hal::timestamp() >= start + 1000);
    }
}
