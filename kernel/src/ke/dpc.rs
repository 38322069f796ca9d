//! Deferred procedure calls.
//!
//! Work registered at elevated priority runs later at DPC level, after the
//! interrupt section unwinds. Three FIFO queues, drained highest priority
//! first; the scheduler's preempted task switch runs after a drain.

use alloc::collections::VecDeque;

use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::{sched, SpinLock};
use crate::status::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpcPriority {
    High,
    Normal,
    Low,
}

pub type DpcCallback = fn(usize);

struct Dpc {
    callback: DpcCallback,
    context: usize,
}

const QUEUE_COUNT: usize = 3;
const EMPTY_QUEUE: SpinLock<VecDeque<Dpc>> = SpinLock::new(VecDeque::new());

/// Index 0 drains first.
static QUEUES: [SpinLock<VecDeque<Dpc>>; QUEUE_COUNT] = [EMPTY_QUEUE; QUEUE_COUNT];

struct DpcFlags {
    pending: bool,
    processing: bool,
}

static FLAGS: SpinLock<DpcFlags> = SpinLock::new(DpcFlags {
    pending: false,
    processing: false,
});

fn queue_index(priority: DpcPriority) -> usize {
    match priority {
        DpcPriority::High => 0,
        DpcPriority::Normal => 1,
        DpcPriority::Low => 2,
    }
}

/// Queue a callback. Must be called above passive level; passive code can
/// simply call the function itself.
pub fn register(priority: DpcPriority, callback: DpcCallback, context: usize) -> Result {
    let now = prio::current();
    if now == PriorityLevel::PASSIVE {
        panic_ex(
            PanicCode::PriorityLevelTooLow,
            [now.raw() as usize, PriorityLevel::DPC.raw() as usize, 0, 0],
        );
    }

    QUEUES[queue_index(priority)]
        .lock()
        .push_back(Dpc { callback, context });

    let mut flags = FLAGS.lock();
    if !flags.processing {
        flags.pending = true;
    }
    Ok(())
}

/// Drain the queues if work is pending and the current level permits.
/// Called at the end of every interrupt section and after a yield lowers
/// the level.
pub fn process_queue() {
    if prio::current() > PriorityLevel::DPC {
        return;
    }

    {
        let mut flags = FLAGS.lock();
        if !flags.pending || flags.processing {
            return;
        }
        flags.pending = false;
        flags.processing = true;
    }

    {
        let _dpc = prio::raise(PriorityLevel::DPC);
        for queue in &QUEUES {
            loop {
                // Take the head with the queue unlocked around the call so
                // the callback may register further DPCs.
                let dpc = match queue.lock().pop_front() {
                    Some(dpc) => dpc,
                    None => break,
                };
                (dpc.callback)(dpc.context);
            }
        }
    }

    FLAGS.lock().processing = false;
    sched::perform_pending_switch();
}

pub fn is_pending() -> bool {
    FLAGS.lock().pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::prio;
    use crate::ke::spinlock::SpinLock;
    use alloc::vec::Vec;

    static ORDER: SpinLock<Vec<usize>> = SpinLock::new(Vec::new());

    fn record(tag: usize) {
        ORDER.lock().push(tag);
    }

    #[test]
    fn drains_highest_priority_first() {
        {
            let _elevated = prio::raise(PriorityLevel::DPC);
            register(DpcPriority::Low, record, 3).unwrap();
            register(DpcPriority::Normal, record, 2).unwrap();
            register(DpcPriority::High, record, 1).unwrap();
        }
        process_queue();

        let order = ORDER.lock().clone();
        let tail = &order[order.len() - 3..];
        assert_eq!(tail, &[1, 2, 3]);
        assert!(!is_pending());
    }

    #[test]
    #[should_panic(expected = "PriorityLevelTooLow")]
    fn registering_at_passive_level_panics() {
        let _ = register(DpcPriority::Normal, record, 0);
    }
}
