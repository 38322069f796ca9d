//! Preemptive multi-priority scheduler.
//!
//! Ready tasks sit in shared `queues[major][minor]` slots; every CPU runs its
//! own scheduling decision over them, filtered by task affinity. Policy is
//! strict priority with round-robin inside a slot. The running task of a CPU
//! is on no queue; `attach_last_task` re-files it according to its requested
//! state once the context switch has landed on the inbound side.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{MAX_CPU_COUNT, TIME_SLICE_NS};
use crate::hal;
use crate::it;
use crate::ke::dpc::{self, DpcPriority};
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::task::{
    self, BlockReason, MajorPriority, PrivilegeLevel, Task, TaskEntry, TaskFlags, TaskSched,
    TaskState, MAJOR_PRIORITY_COUNT, MINOR_PRIORITY_COUNT, MINOR_PRIORITY_LIMIT,
};
use crate::ke::{mutex, sleep, worker, SpinLock, SpinLockGuard};
use crate::ob::Lockable;
use crate::rtl::CpuSet;
use crate::status::Result;

type ReadyQueue = SpinLock<VecDeque<Arc<Task>>>;

const EMPTY_READY: ReadyQueue = SpinLock::new(VecDeque::new());
const EMPTY_ROW: [ReadyQueue; MINOR_PRIORITY_COUNT] = [EMPTY_READY; MINOR_PRIORITY_COUNT];

static READY: [[ReadyQueue; MINOR_PRIORITY_COUNT]; MAJOR_PRIORITY_COUNT] =
    [EMPTY_ROW; MAJOR_PRIORITY_COUNT];

static FINISHED: SpinLock<VecDeque<Arc<Task>>> = SpinLock::new(VecDeque::new());

#[derive(Default)]
struct CpuState {
    current: Option<Arc<Task>>,
    next: Option<Arc<Task>>,
    last: Option<Arc<Task>>,
}

const EMPTY_CPU: SpinLock<CpuState> = SpinLock::new(CpuState {
    current: None,
    next: None,
    last: None,
});

static CPU_STATE: [SpinLock<CpuState>; MAX_CPU_COUNT] = [EMPTY_CPU; MAX_CPU_COUNT];
static SWITCH_PENDING: [AtomicBool; MAX_CPU_COUNT] =
    [const { AtomicBool::new(false) }; MAX_CPU_COUNT];
static SWITCH_IN_PROGRESS: [AtomicBool; MAX_CPU_COUNT] =
    [const { AtomicBool::new(false) }; MAX_CPU_COUNT];

static STARTED: AtomicBool = AtomicBool::new(false);
static CLEANUP_TASK: spin::Once<Arc<Task>> = spin::Once::new();

pub fn current_task() -> Option<Arc<Task>> {
    CPU_STATE[hal::current_cpu()].lock().current.clone()
}

pub fn current_task_of(cpu: usize) -> Option<Arc<Task>> {
    CPU_STATE[cpu].lock().current.clone()
}

fn ready_queue(major: MajorPriority, minor: u8) -> &'static ReadyQueue {
    &READY[major as usize][minor as usize]
}

/// Append to the ready slot matching the task's priority. Caller holds the
/// task's object lock.
fn attach_locked(task: &Arc<Task>, sched: &mut TaskSched) {
    if sched.on_run_queue {
        return;
    }
    sched.on_run_queue = true;
    ready_queue(sched.major, sched.minor)
        .lock()
        .push_back(Arc::clone(task));
}

/// Make an uninitialized task runnable.
pub fn enable(task: &Arc<Task>) -> Result {
    let mut sched = task.lock_object();
    if sched.state == TaskState::Uninitialized {
        sched.state = TaskState::ReadyToRun;
        sched.requested_state = TaskState::ReadyToRun;
        attach_locked(task, &mut sched);
    }
    Ok(())
}

pub fn change_major_priority(task: &Arc<Task>, major: MajorPriority) {
    task.lock_object().major = major;
}

pub fn change_minor_priority(task: &Arc<Task>, minor: u8) {
    task.lock_object().minor = minor.min(MINOR_PRIORITY_LIMIT);
}

pub fn set_affinity(task: &Arc<Task>, affinity: CpuSet) {
    task.lock_object().affinity = affinity;
}

/// Request that a task stop running. Event sleeps go through
/// [`event_sleep`] only.
pub fn block(task: &Arc<Task>, reason: BlockReason) {
    if reason == BlockReason::EventSleep {
        return;
    }
    let mut sched = task.lock_object();
    if sched.flags.contains(TaskFlags::IDLE) {
        panic_ex(PanicCode::UnexpectedFault, [task.id.raw() as usize, 0, 0, 0]);
    }
    sched.requested_state = TaskState::Waiting;
    sched.block_reason = reason;
    detach_locked(task, &mut sched);
}

fn detach_locked(task: &Arc<Task>, sched: &mut TaskSched) {
    if !sched.on_run_queue {
        return;
    }
    sched.on_run_queue = false;
    ready_queue(sched.major, sched.minor)
        .lock()
        .retain(|t| !Arc::ptr_eq(t, task));
}

/// Undo a block. A task that is still running on some CPU stays detached;
/// the CPU re-files it when it switches away.
pub fn unblock(task: &Arc<Task>) {
    let mut sched = task.lock_object();
    if sched.block_reason == BlockReason::EventSleep {
        return;
    }
    sched.block_reason = BlockReason::NotBlocked;
    if sched.state == TaskState::Waiting {
        attach_locked(task, &mut sched);
    }
    if sched.state == TaskState::Running {
        sched.requested_state = TaskState::ReadyToRun;
    } else {
        sched.state = TaskState::ReadyToRun;
    }
}

/// Sleep until [`wake`]. A wake-up that already happened is consumed
/// without blocking.
pub fn event_sleep() {
    let task = match current_task() {
        Some(task) => task,
        None => return,
    };
    let mut sched = task.lock_object();
    if sched.notified {
        sched.notified = false;
        return;
    }
    sched.requested_state = TaskState::Waiting;
    sched.block_reason = BlockReason::EventSleep;
    detach_locked(&task, &mut sched);
    drop(sched);
    yield_now();
}

/// Latch a wake-up; re-files the task if it is event-sleeping right now.
pub fn wake(task: &Arc<Task>) {
    let mut sched = task.lock_object();
    sched.notified = true;
    if sched.state == TaskState::Waiting && sched.block_reason == BlockReason::EventSleep {
        attach_locked(task, &mut sched);
        sched.state = TaskState::ReadyToRun;
        sched.block_reason = BlockReason::NotBlocked;
    }
}

/// Terminate the calling task. Cleanup happens in the cleanup worker.
pub fn finish_current() {
    if let Some(task) = current_task() {
        task.lock_object().requested_state = TaskState::Finished;
    }
    yield_now();
}

fn keep_current(sched: &mut SpinLockGuard<'_, TaskSched>) {
    sched.state = TaskState::Running;
    sched.requested_state = TaskState::ReadyToRun;
    hal::start_system_timer(TIME_SLICE_NS);
}

/// The scheduling decision. Runs at DPC level; fills `next` for the CPU or
/// keeps the current task.
pub fn schedule(cpu: usize) {
    sleep::refresh();
    mutex::timed_refresh();

    let mut cpu_state = CPU_STATE[cpu].lock();

    for major_index in 0..MAJOR_PRIORITY_COUNT {
        for minor in 0..MINOR_PRIORITY_COUNT {
            // A current task that outranks this slot and still wants the CPU
            // simply keeps it.
            if let Some(current) = &cpu_state.current {
                let mut sched = current.lock_object();
                if sched.affinity.contains(cpu)
                    && (sched.major as usize) <= major_index
                    && (sched.minor as usize) < minor
                    && matches!(
                        sched.requested_state,
                        TaskState::Running | TaskState::ReadyToRun
                    )
                {
                    keep_current(&mut sched);
                    drop(sched);
                    cpu_state.next = None;
                    return;
                }
            }

            let mut queue = READY[major_index][minor].lock();
            if let Some(head) = queue.front() {
                let head = Arc::clone(head);
                let mut sched = head.lock_object();
                if !sched.affinity.contains(cpu) {
                    continue;
                }
                sched.state = TaskState::Running;
                sched.requested_state = TaskState::ReadyToRun;
                sched.on_run_queue = false;
                drop(sched);
                queue.pop_front();
                drop(queue);
                cpu_state.next = Some(head);
                hal::start_system_timer(TIME_SLICE_NS);
                return;
            }
        }
    }

    if let Some(current) = &cpu_state.current {
        let mut sched = current.lock_object();
        if sched.affinity.contains(cpu)
            && matches!(
                sched.requested_state,
                TaskState::Running | TaskState::ReadyToRun
            )
        {
            keep_current(&mut sched);
            drop(sched);
            cpu_state.next = None;
            return;
        }
    }

    // The per-CPU idle tasks make an empty decision impossible.
    panic_ex(PanicCode::NoExecutableTask, [cpu, 0, 0, 0]);
}

/// Re-file the task this CPU just switched away from. Called by the
/// architecture switch code on the inbound side.
pub fn attach_last_task(cpu: usize) {
    let last = CPU_STATE[cpu].lock().last.take();
    if let Some(last) = last {
        let mut sched = last.lock_object();
        match sched.requested_state {
            TaskState::ReadyToRun | TaskState::Running => {
                sched.state = TaskState::ReadyToRun;
                attach_locked(&last, &mut sched);
            }
            TaskState::Waiting => {
                // Already detached by the blocker.
                sched.state = TaskState::Waiting;
            }
            TaskState::Finished => {
                sched.state = TaskState::Finished;
                drop(sched);
                FINISHED.lock().push_back(last);
                if let Some(cleanup) = CLEANUP_TASK.get() {
                    wake(cleanup);
                }
            }
            TaskState::Uninitialized => {
                panic_ex(PanicCode::UnexpectedFault, [cpu, 1, 0, 0]);
            }
        }
    }
    SWITCH_IN_PROGRESS[cpu].store(false, Ordering::SeqCst);
}

/// Service a pending switch decision, if any.
pub fn perform_pending_switch() {
    let cpu = hal::current_cpu();
    if !SWITCH_PENDING[cpu].swap(false, Ordering::SeqCst) {
        return;
    }
    if SWITCH_IN_PROGRESS[cpu].swap(true, Ordering::SeqCst) {
        return;
    }

    let (old, new) = {
        let mut cpu_state = CPU_STATE[cpu].lock();
        match cpu_state.next.take() {
            Some(next) => {
                let old = cpu_state.current.take();
                cpu_state.last = old.clone();
                cpu_state.current = Some(Arc::clone(&next));
                (old, Some(next))
            }
            None => (None, None),
        }
    };

    match new {
        // The inbound side clears SWITCH_IN_PROGRESS in attach_last_task.
        Some(new) => hal::switch_tasks(old.as_deref(), &new),
        None => SWITCH_IN_PROGRESS[cpu].store(false, Ordering::SeqCst),
    }
}

/// Give up the CPU. Passive level only.
pub fn yield_now() {
    let now = prio::current();
    if now > PriorityLevel::PASSIVE {
        panic_ex(
            PanicCode::PriorityLevelTooHigh,
            [now.raw() as usize, PriorityLevel::PASSIVE.raw() as usize, 0, 0],
        );
    }

    let cpu = hal::current_cpu();
    {
        // No timer IRQ may race the decision.
        let _dpc = prio::raise(PriorityLevel::DPC);
        if !SWITCH_PENDING[cpu].load(Ordering::SeqCst) && !SWITCH_IN_PROGRESS[cpu].load(Ordering::SeqCst)
        {
            schedule(cpu);
            SWITCH_PENDING[cpu].store(true, Ordering::SeqCst);
        }
    }
    perform_pending_switch();
}

fn scheduler_worker(cpu: usize) {
    if !SWITCH_PENDING[cpu].load(Ordering::SeqCst) && !SWITCH_IN_PROGRESS[cpu].load(Ordering::SeqCst)
    {
        schedule(cpu);
        SWITCH_PENDING[cpu].store(true, Ordering::SeqCst);
    }
}

fn scheduler_isr(_context: usize) -> Result {
    dpc::register(DpcPriority::Normal, scheduler_worker, hal::current_cpu())?;
    hal::start_system_timer(TIME_SLICE_NS);
    Ok(())
}

fn idle_loop(_context: usize) {
    loop {
        hal::idle_wait();
    }
}

fn create_idle_task(cpu: usize) -> Result {
    let task = task::create_process_raw("Idle task", None, PrivilegeLevel::Kernel, idle_loop, 0)?;
    {
        let mut sched = task.lock_object();
        sched.major = MajorPriority::Lowest;
        sched.minor = MINOR_PRIORITY_LIMIT;
        sched.affinity = CpuSet::single(cpu);
        sched.flags |= TaskFlags::IDLE;
    }
    enable(&task)
}

fn cleanup_worker(_context: usize) {
    loop {
        loop {
            let finished = FINISHED.lock().pop_front();
            match finished {
                Some(task) => task::destroy_tcb(&task),
                None => break,
            }
        }
        event_sleep();
    }
}

/// Bring up scheduling on the bootstrap CPU and never return. The optional
/// continuation becomes the first regular kernel task.
pub fn start(continuation: Option<(&str, TaskEntry, usize)>) -> ! {
    let cpu = hal::current_cpu();
    if let Err(e) = create_idle_task(cpu) {
        panic_ex(PanicCode::BootFailure, [e as usize, 0, 0, 0]);
    }

    if let Some((name, entry, context)) = continuation {
        match task::create_process_raw(name, None, PrivilegeLevel::Kernel, entry, context) {
            Ok(task) => {
                let _ = enable(&task);
            }
            Err(e) => panic_ex(PanicCode::BootFailure, [e as usize, 1, 0, 0]),
        }
    }

    match worker::create("Task cleanup", cleanup_worker, 0) {
        Ok(task) => {
            CLEANUP_TASK.call_once(|| task);
        }
        Err(e) => panic_ex(PanicCode::BootFailure, [e as usize, 2, 0, 0]),
    }

    if let Err(e) = it::install_handler(
        it::SYSTEM_TIMER_VECTOR,
        scheduler_isr,
        0,
        PrivilegeLevel::Kernel,
    ) {
        panic_ex(PanicCode::BootFailure, [e as usize, 3, 0, 0]);
    }
    let _ = it::set_handler_enable(it::SYSTEM_TIMER_VECTOR, scheduler_isr, true);

    STARTED.store(true, Ordering::SeqCst);

    hal::configure_system_timer(it::SYSTEM_TIMER_VECTOR);
    hal::start_system_timer(TIME_SLICE_NS);

    loop {
        yield_now();
    }
}

/// Called by secondary CPUs once their local state is up; parks the boot
/// context in the scheduler.
pub fn join() -> ! {
    while !STARTED.load(Ordering::SeqCst) {
        hal::relax();
    }
    if create_idle_task(hal::current_cpu()).is_err() {
        loop {
            hal::idle_wait();
        }
    }
    hal::configure_system_timer(it::SYSTEM_TIMER_VECTOR);
    hal::start_system_timer(TIME_SLICE_NS);
    loop {
        yield_now();
    }
}

pub fn is_started() -> bool {
    STARTED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub mod testing {
    //! Hooks for driving the scheduler from unit tests.

    use super::*;

    /// Make `task` the running task of `cpu` without a context switch.
    pub fn install_current(cpu: usize, task: &Arc<Task>) {
        {
            let mut sched = task.lock_object();
            sched.state = TaskState::Running;
            sched.requested_state = TaskState::ReadyToRun;
            sched.on_run_queue = false;
        }
        CPU_STATE[cpu].lock().current = Some(Arc::clone(task));
    }

    pub fn clear_cpu(cpu: usize) {
        let mut cpu_state = CPU_STATE[cpu].lock();
        cpu_state.current = None;
        cpu_state.next = None;
        cpu_state.last = None;
        SWITCH_PENDING[cpu].store(false, Ordering::SeqCst);
        SWITCH_IN_PROGRESS[cpu].store(false, Ordering::SeqCst);
    }

    pub fn decided_next(cpu: usize) -> Option<Arc<Task>> {
        CPU_STATE[cpu].lock().next.clone()
    }

    pub fn set_last(cpu: usize, task: &Arc<Task>) {
        CPU_STATE[cpu].lock().last = Some(Arc::clone(task));
    }

    pub fn remove_from_ready(task: &Arc<Task>) {
        let mut sched = task.lock_object();
        detach_locked(task, &mut sched);
    }

    /// Re-file a task on its ready queue regardless of prior state.
    pub fn make_ready(task: &Arc<Task>) {
        let mut sched = task.lock_object();
        sched.state = TaskState::ReadyToRun;
        sched.requested_state = TaskState::ReadyToRun;
        attach_locked(task, &mut sched);
    }

    pub fn finished_queue_contains(task: &Arc<Task>) -> bool {
        FINISHED.lock().iter().any(|t| Arc::ptr_eq(t, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::task::create_process_raw;
    use crate::ke::test_support;

    fn noop(_: usize) {}

    fn new_task(name: &str, major: MajorPriority, minor: u8) -> Arc<Task> {
        let task = create_process_raw(name, None, PrivilegeLevel::Kernel, noop, 0).unwrap();
        change_major_priority(&task, major);
        change_minor_priority(&task, minor);
        task
    }

    fn cleanup(tasks: &[&Arc<Task>]) {
        for task in tasks {
            testing::remove_from_ready(task);
            task::destroy_tcb(task);
        }
    }

    #[test]
    fn strict_priority_wins_over_lower_slots() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let urgent = new_task("urgent", MajorPriority::Highest, 0);
        let background = new_task("background", MajorPriority::Background, 2);
        enable(&background).unwrap();
        enable(&urgent).unwrap();

        let _dpc = prio::raise(PriorityLevel::DPC);
        schedule(cpu);
        let next = testing::decided_next(cpu).expect("a task must be chosen");
        assert!(Arc::ptr_eq(&next, &urgent));

        testing::clear_cpu(cpu);
        cleanup(&[&urgent, &background]);
    }

    #[test]
    fn round_robin_within_a_slot() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let a = new_task("a", MajorPriority::Normal, 9);
        let b = new_task("b", MajorPriority::Normal, 9);
        enable(&a).unwrap();
        enable(&b).unwrap();

        let _dpc = prio::raise(PriorityLevel::DPC);
        schedule(cpu);
        let first = testing::decided_next(cpu).unwrap();
        assert!(Arc::ptr_eq(&first, &a));

        // Pretend the switch happened and `a` was preempted: it goes to the
        // tail, so `b` runs next.
        testing::clear_cpu(cpu);
        testing::set_last(cpu, &a);
        attach_last_task(cpu);
        schedule(cpu);
        let second = testing::decided_next(cpu).unwrap();
        assert!(Arc::ptr_eq(&second, &b));

        testing::clear_cpu(cpu);
        cleanup(&[&a, &b]);
    }

    #[test]
    fn affinity_excludes_a_cpu() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let elsewhere = new_task("elsewhere", MajorPriority::Interactive, 3);
        set_affinity(&elsewhere, CpuSet::single(cpu + 1));
        let local = new_task("local", MajorPriority::Background, 11);
        enable(&elsewhere).unwrap();
        enable(&local).unwrap();

        let _dpc = prio::raise(PriorityLevel::DPC);
        schedule(cpu);
        let next = testing::decided_next(cpu).unwrap();
        assert!(Arc::ptr_eq(&next, &local));

        testing::clear_cpu(cpu);
        cleanup(&[&elsewhere, &local]);
    }

    #[test]
    fn running_task_keeps_cpu_against_lower_priority() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let running = new_task("running", MajorPriority::Normal, 4);
        testing::install_current(cpu, &running);
        let lower = new_task("lower", MajorPriority::Normal, 12);
        enable(&lower).unwrap();

        let _dpc = prio::raise(PriorityLevel::DPC);
        schedule(cpu);
        // Decision: keep current, nothing staged.
        assert!(testing::decided_next(cpu).is_none());
        assert_eq!(running.lock_object().state, TaskState::Running);

        testing::clear_cpu(cpu);
        cleanup(&[&running, &lower]);
    }

    #[test]
    fn blocked_task_is_removed_and_unblock_refiles_it() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let sleeper = new_task("sleeper", MajorPriority::Interactive, 14);
        let fallback = new_task("fallback", MajorPriority::Lowest, 15);
        enable(&sleeper).unwrap();
        enable(&fallback).unwrap();

        block(&sleeper, BlockReason::Io);
        {
            let mut sched = sleeper.lock_object();
            assert!(!sched.on_run_queue);
            assert_eq!(sched.requested_state, TaskState::Waiting);
            // Not on a CPU: the waiting state takes effect directly.
            sched.state = TaskState::Waiting;
        }

        {
            let _dpc = prio::raise(PriorityLevel::DPC);
            schedule(cpu);
            let next = testing::decided_next(cpu).unwrap();
            assert!(Arc::ptr_eq(&next, &fallback));
        }

        unblock(&sleeper);
        {
            let sched = sleeper.lock_object();
            assert!(sched.on_run_queue);
            assert_eq!(sched.state, TaskState::ReadyToRun);
        }

        testing::clear_cpu(cpu);
        cleanup(&[&sleeper, &fallback]);
    }

    #[test]
    fn event_sleep_consumes_latched_wakeup() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let task = new_task("waiter", MajorPriority::Normal, 7);
        testing::install_current(cpu, &task);

        wake(&task);
        assert!(task.lock_object().notified);

        // A latched wake-up makes event_sleep return without blocking.
        event_sleep();
        {
            let sched = task.lock_object();
            assert!(!sched.notified);
            assert_eq!(sched.state, TaskState::Running);
        }

        testing::clear_cpu(cpu);
        cleanup(&[&task]);
    }

    #[test]
    fn finished_task_lands_on_cleanup_queue() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let doomed = new_task("doomed", MajorPriority::Normal, 7);
        {
            let mut sched = doomed.lock_object();
            sched.state = TaskState::Running;
            sched.requested_state = TaskState::Finished;
        }
        testing::set_last(cpu, &doomed);
        attach_last_task(cpu);

        assert_eq!(doomed.lock_object().state, TaskState::Finished);
        assert!(testing::finished_queue_contains(&doomed));

        testing::clear_cpu(cpu);
        task::destroy_tcb(&doomed);
    }

    #[test]
    #[should_panic(expected = "UnexpectedFault")]
    fn blocking_the_idle_task_panics() {
        let idle = new_task("idle", MajorPriority::Lowest, 15);
        idle.lock_object().flags |= TaskFlags::IDLE;
        block(&idle, BlockReason::Io);
    }

    #[test]
    #[should_panic(expected = "PriorityLevelTooHigh")]
    fn yield_above_passive_panics() {
        let _dpc = prio::raise(PriorityLevel::DPC);
        yield_now();
    }
}
