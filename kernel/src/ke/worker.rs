//! Kernel worker threads.
//!
//! All workers are threads of one shared kernel worker process; the first
//! request creates it.

use alloc::sync::Arc;

use crate::ke::task::{
    self, PrivilegeLevel, Process, Task, TaskEntry, TaskFlags, DEFAULT_MINOR_PRIORITY,
};
use crate::ke::{sched, SpinLock};
use crate::status::Result;

static WORKER_PROCESS: SpinLock<Option<Arc<Process>>> = SpinLock::new(None);

/// Create and start a kernel worker thread.
pub fn create(name: &str, entry: TaskEntry, context: usize) -> Result<Arc<Task>> {
    let process = {
        let mut holder = WORKER_PROCESS.lock();
        match &*holder {
            Some(process) => Arc::clone(process),
            None => {
                let process = task::prepare_pcb(PrivilegeLevel::Kernel, None)?;
                *holder = Some(Arc::clone(&process));
                process
            }
        }
    };

    let flags = if process.state.lock().threads.is_empty() {
        TaskFlags::MAIN
    } else {
        TaskFlags::empty()
    };
    let worker = task::create_thread(&process, name, flags, entry, context)?;
    sched::change_minor_priority(&worker, DEFAULT_MINOR_PRIORITY);
    sched::enable(&worker)?;
    Ok(worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::sched::testing;
    use crate::ke::task::TaskState;
    use crate::ke::test_support;
    use crate::ob::Lockable;

    fn noop(_: usize) {}

    #[test]
    fn workers_share_one_process() {
        let _serial = test_support::lock();
        let a = create("worker a", noop, 0).unwrap();
        let b = create("worker b", noop, 0).unwrap();
        assert!(Arc::ptr_eq(&a.process, &b.process));
        assert_eq!(a.lock_object().state, TaskState::ReadyToRun);
        assert_eq!(b.lock_object().state, TaskState::ReadyToRun);

        for t in [&a, &b] {
            testing::remove_from_ready(t);
            task::destroy_tcb(t);
        }
    }
}
