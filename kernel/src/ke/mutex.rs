//! Yielding synchronization primitives.
//!
//! All of them queue contended waiters FIFO on their own list, block the
//! waiter and, for finite timeouts, file it on one global timed-wait queue
//! sorted by deadline. An expired wait resumes the task with
//! `block.acquired == false`.
//!
//! Lock order, outermost first: timed-wait queue, primitive state, task
//! object lock. The fast paths take only the primitive lock.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::hal;
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::task::{BlockReason, Task};
use crate::ke::{sched, SpinLock};
use crate::ob::Lockable;

/// Give up immediately if the primitive is taken.
pub const NO_WAIT: u64 = 0;
/// Wait forever.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// What a blocked task is waiting on, kept in its TCB so the timed-wait
/// refresh can pull it out of the right list.
pub enum WaitChannel {
    Mutex(Weak<SpinLock<MutexState>>),
    Semaphore(Weak<SpinLock<SemaphoreState>>),
    RwLock(Weak<SpinLock<RwLockState>>),
}

type TimedQueue = VecDeque<Arc<Task>>;

static TIMED_WAITERS: SpinLock<TimedQueue> = SpinLock::new(VecDeque::new());
/// Deadline of the queue head; `u64::MAX` when empty. Read without the lock
/// as the schedule-time fast path.
static EARLIEST_DEADLINE: AtomicU64 = AtomicU64::new(u64::MAX);

fn refresh_earliest(queue: &TimedQueue) {
    let earliest = queue
        .front()
        .map(|t| t.lock_object().block.timeout_until)
        .unwrap_or(u64::MAX);
    EARLIEST_DEADLINE.store(earliest, Ordering::Relaxed);
}

fn timed_insert(queue: &mut TimedQueue, task: &Arc<Task>, deadline: u64) {
    let position = queue
        .iter()
        .position(|t| t.lock_object().block.timeout_until > deadline)
        .unwrap_or(queue.len());
    queue.insert(position, Arc::clone(task));
    refresh_earliest(queue);
}

fn timed_remove(queue: &mut TimedQueue, task: &Arc<Task>) {
    queue.retain(|t| !Arc::ptr_eq(t, task));
    refresh_earliest(queue);
}

/// Mark the task admitted and make it runnable again. The caller already
/// fixed the primitive's own state.
fn grant(timed: &mut TimedQueue, task: &Arc<Task>) {
    {
        let mut sched_state = task.lock_object();
        sched_state.block.acquired = true;
        sched_state.block.waiting_on = None;
        sched_state.block.on_timed_queue = false;
        sched_state.block.timeout_until = 0;
    }
    timed_remove(timed, task);
    sched::unblock(task);
}

fn absolute_deadline(timeout: u64) -> u64 {
    hal::timestamp().saturating_add(timeout)
}

fn current_task_or_die() -> Arc<Task> {
    match sched::current_task() {
        Some(task) => task,
        None => panic_ex(PanicCode::UnexpectedFault, [0, 0, 0, 0]),
    }
}

/// Suspend after enqueueing and report the outcome recorded by the grantor
/// or the timed-wait expiry.
fn finish_wait(task: &Arc<Task>) -> bool {
    sched::yield_now();
    task.lock_object().block.acquired
}

// ----------------------------------------------------------------------- mutex

pub struct MutexState {
    owner: Option<Arc<Task>>,
    recursion: u32,
    waiters: VecDeque<Arc<Task>>,
}

impl MutexState {
    fn try_take(&mut self, task: &Arc<Task>) -> bool {
        match &self.owner {
            None => {
                self.owner = Some(Arc::clone(task));
                self.recursion = 1;
                true
            }
            Some(owner) if Arc::ptr_eq(owner, task) => {
                self.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn remove_waiter(&mut self, task: &Arc<Task>) {
        self.waiters.retain(|t| !Arc::ptr_eq(t, task));
    }
}

/// Recursive sleeping mutex with FIFO handoff.
pub struct Mutex {
    inner: Arc<SpinLock<MutexState>>,
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: Arc::new(SpinLock::new(MutexState {
                owner: None,
                recursion: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire with a timeout in nanoseconds ([`NO_WAIT`] / [`NO_TIMEOUT`]).
    /// Returns whether the mutex was acquired. Passive level only.
    pub fn acquire(&self, timeout: u64) -> bool {
        prio::check(PriorityLevel::PASSIVE, PriorityLevel::PASSIVE);
        let task = current_task_or_die();

        {
            let mut state = self.inner.lock();
            if state.try_take(&task) {
                return true;
            }
            if timeout == NO_WAIT {
                return false;
            }
        }

        let deadline = absolute_deadline(timeout);
        let mut timed = (timeout < NO_TIMEOUT).then(|| TIMED_WAITERS.lock());
        {
            let mut state = self.inner.lock();
            // The owner may have released while the locks were reordered.
            if state.try_take(&task) {
                return true;
            }

            sched::block(&task, BlockReason::Mutex);
            {
                let mut sched_state = task.lock_object();
                sched_state.block.waiting_on =
                    Some(WaitChannel::Mutex(Arc::downgrade(&self.inner)));
                sched_state.block.acquired = false;
                sched_state.block.timeout_until = if timeout < NO_TIMEOUT { deadline } else { 0 };
                sched_state.block.on_timed_queue = timeout < NO_TIMEOUT;
            }
            state.waiters.push_back(Arc::clone(&task));
            if let Some(timed) = timed.as_mut() {
                timed_insert(timed, &task, deadline);
            }
        }
        drop(timed);

        finish_wait(&task)
    }

    /// Release; hands the mutex to the first waiter once the recursion
    /// count drains. Releasing an unowned mutex is fatal.
    pub fn release(&self) {
        let mut timed = TIMED_WAITERS.lock();
        let mut state = self.inner.lock();
        if state.owner.is_none() || state.recursion == 0 {
            panic_ex(
                PanicCode::UnacquiredMutexReleased,
                [Arc::as_ptr(&self.inner) as usize, 0, 0, 0],
            );
        }
        state.recursion -= 1;
        if state.recursion > 0 {
            return;
        }

        match state.waiters.pop_front() {
            None => {
                state.owner = None;
            }
            Some(next) => {
                state.owner = Some(Arc::clone(&next));
                state.recursion = 1;
                drop(state);
                grant(&mut timed, &next);
            }
        }
    }

    pub fn owner(&self) -> Option<Arc<Task>> {
        self.inner.lock().owner.clone()
    }
}

// ------------------------------------------------------------------- semaphore

pub struct SemaphoreState {
    /// Units currently held.
    current: u32,
    max: u32,
    waiters: VecDeque<Arc<Task>>,
    /// Cached unit count of the head waiter.
    needed: u32,
}

impl SemaphoreState {
    fn free_units(&self) -> u32 {
        self.max - self.current
    }

    fn refresh_needed(&mut self) {
        self.needed = match self.waiters.front() {
            Some(next) => next.lock_object().block.units,
            None => 0,
        };
    }

    /// Admit head waiters while enough units are free for them. All the
    /// requested units are granted to a waiter at once.
    fn process_waiters(&mut self, timed: &mut TimedQueue) {
        loop {
            if self.waiters.is_empty() {
                self.needed = 0;
                return;
            }
            if self.free_units() < self.needed {
                return;
            }
            let head = Arc::clone(self.waiters.front().unwrap());
            let units = head.lock_object().block.units;
            if self.free_units() < units {
                return;
            }
            self.waiters.pop_front();
            self.current += units;
            self.refresh_needed();
            grant(timed, &head);
        }
    }

    fn remove_waiter(&mut self, task: &Arc<Task>) {
        let was_head = self
            .waiters
            .front()
            .map(|t| Arc::ptr_eq(t, task))
            .unwrap_or(false);
        self.waiters.retain(|t| !Arc::ptr_eq(t, task));
        if was_head {
            self.refresh_needed();
        }
    }
}

/// Counting semaphore with head-of-line blocking: a later waiter never
/// overtakes a blocked head, even when enough units are free for it.
pub struct Semaphore {
    inner: Arc<SpinLock<SemaphoreState>>,
}

impl Semaphore {
    /// `initial` units start out held; `max` bounds the total.
    pub fn new(initial: u32, max: u32) -> Semaphore {
        Semaphore {
            inner: Arc::new(SpinLock::new(SemaphoreState {
                current: initial,
                max,
                waiters: VecDeque::new(),
                needed: 0,
            })),
        }
    }

    pub fn acquire(&self, units: u32, timeout: u64) -> bool {
        prio::check(PriorityLevel::PASSIVE, PriorityLevel::PASSIVE);
        if units > self.inner.lock().max {
            return false;
        }
        let task = current_task_or_die();

        {
            let mut state = self.inner.lock();
            if state.waiters.is_empty() && state.free_units() >= units {
                state.current += units;
                return true;
            }
            if timeout == NO_WAIT {
                return false;
            }
        }

        let deadline = absolute_deadline(timeout);
        let mut timed = (timeout < NO_TIMEOUT).then(|| TIMED_WAITERS.lock());
        {
            let mut state = self.inner.lock();
            if state.waiters.is_empty() && state.free_units() >= units {
                state.current += units;
                return true;
            }

            sched::block(&task, BlockReason::Semaphore);
            {
                let mut sched_state = task.lock_object();
                sched_state.block.waiting_on =
                    Some(WaitChannel::Semaphore(Arc::downgrade(&self.inner)));
                sched_state.block.acquired = false;
                sched_state.block.units = units;
                sched_state.block.timeout_until = if timeout < NO_TIMEOUT { deadline } else { 0 };
                sched_state.block.on_timed_queue = timeout < NO_TIMEOUT;
            }
            if state.waiters.is_empty() {
                state.needed = units;
            }
            state.waiters.push_back(Arc::clone(&task));
            if let Some(timed) = timed.as_mut() {
                timed_insert(timed, &task, deadline);
            }
        }
        drop(timed);

        finish_wait(&task)
    }

    pub fn release(&self, units: u32) {
        let mut timed = TIMED_WAITERS.lock();
        let mut state = self.inner.lock();
        if state.current < units {
            panic_ex(
                PanicCode::UnacquiredMutexReleased,
                [
                    Arc::as_ptr(&self.inner) as usize,
                    state.current as usize,
                    units as usize,
                    0,
                ],
            );
        }
        state.current -= units;
        state.process_waiters(&mut timed);
    }

    pub fn held_units(&self) -> u32 {
        self.inner.lock().current
    }
}

// ---------------------------------------------------------------------- rwlock

pub struct RwLockState {
    readers: u32,
    writers: u32,
    waiters: VecDeque<Arc<Task>>,
    /// Write flag of the head waiter; arbitration policy for releases.
    head_is_writer: bool,
}

impl RwLockState {
    fn is_contended_for(&self, write: bool) -> bool {
        if self.writers != 0 {
            return true;
        }
        if write {
            // Writers are exclusive and queue behind anyone already waiting.
            self.readers != 0 || !self.waiters.is_empty()
        } else {
            // Readers share, but never slip past a writer waiting at the
            // head of the queue.
            (!self.waiters.is_empty() && self.head_is_writer) || self.readers == u32::MAX
        }
    }

    fn take(&mut self, write: bool) {
        if write {
            self.writers = 1;
        } else {
            self.readers += 1;
        }
    }

    /// Admit waiters from the head: a run of readers, or one writer
    /// exclusively.
    fn process_waiters(&mut self, timed: &mut TimedQueue) {
        while !self.head_is_writer || self.readers == 0 {
            let head = match self.waiters.front() {
                Some(head) => Arc::clone(head),
                None => break,
            };
            let head_writes = head.lock_object().block.write;
            let admissible = if head_writes {
                self.readers == 0 && self.writers == 0
            } else {
                self.writers == 0
            };
            if !admissible {
                break;
            }

            self.waiters.pop_front();
            if let Some(next) = self.waiters.front() {
                self.head_is_writer = next.lock_object().block.write;
            }
            self.take(head_writes);
            grant(timed, &head);
            if self.writers != 0 {
                break;
            }
        }
    }

    fn remove_waiter(&mut self, task: &Arc<Task>) {
        let was_head = self
            .waiters
            .front()
            .map(|t| Arc::ptr_eq(t, task))
            .unwrap_or(false);
        self.waiters.retain(|t| !Arc::ptr_eq(t, task));
        if was_head {
            if let Some(next) = self.waiters.front() {
                self.head_is_writer = next.lock_object().block.write;
            }
        }
    }
}

/// Reader/writer lock. Writers are exclusive; readers pile up behind a
/// waiting writer instead of overtaking it.
pub struct RwLock {
    inner: Arc<SpinLock<RwLockState>>,
}

impl Default for RwLock {
    fn default() -> RwLock {
        RwLock::new()
    }
}

impl RwLock {
    pub fn new() -> RwLock {
        RwLock {
            inner: Arc::new(SpinLock::new(RwLockState {
                readers: 0,
                writers: 0,
                waiters: VecDeque::new(),
                head_is_writer: false,
            })),
        }
    }

    pub fn acquire(&self, write: bool, timeout: u64) -> bool {
        prio::check(PriorityLevel::PASSIVE, PriorityLevel::PASSIVE);
        let task = current_task_or_die();

        {
            let mut state = self.inner.lock();
            if !state.is_contended_for(write) {
                state.take(write);
                return true;
            }
            if timeout == NO_WAIT {
                return false;
            }
        }

        let deadline = absolute_deadline(timeout);
        let mut timed = (timeout < NO_TIMEOUT).then(|| TIMED_WAITERS.lock());
        {
            let mut state = self.inner.lock();
            if !state.is_contended_for(write) {
                state.take(write);
                return true;
            }

            sched::block(&task, BlockReason::RwLock);
            {
                let mut sched_state = task.lock_object();
                sched_state.block.waiting_on =
                    Some(WaitChannel::RwLock(Arc::downgrade(&self.inner)));
                sched_state.block.acquired = false;
                sched_state.block.write = write;
                sched_state.block.timeout_until = if timeout < NO_TIMEOUT { deadline } else { 0 };
                sched_state.block.on_timed_queue = timeout < NO_TIMEOUT;
            }
            if state.waiters.is_empty() {
                state.head_is_writer = write;
            }
            state.waiters.push_back(Arc::clone(&task));
            if let Some(timed) = timed.as_mut() {
                timed_insert(timed, &task, deadline);
            }
        }
        drop(timed);

        finish_wait(&task)
    }

    pub fn release(&self) {
        let mut timed = TIMED_WAITERS.lock();
        let mut state = self.inner.lock();
        if state.readers == 0 && state.writers == 0 {
            panic_ex(
                PanicCode::UnacquiredMutexReleased,
                [Arc::as_ptr(&self.inner) as usize, 0, 0, 1],
            );
        }
        if state.writers != 0 {
            state.writers = 0;
        } else {
            state.readers -= 1;
        }
        if !state.waiters.is_empty() {
            state.process_waiters(&mut timed);
        }
    }

    pub fn reader_count(&self) -> u32 {
        self.inner.lock().readers
    }

    pub fn has_writer(&self) -> bool {
        self.inner.lock().writers != 0
    }
}

// ---------------------------------------------------------------- timed expiry

/// Wake every timed waiter whose deadline has passed, pulling it out of its
/// primitive's wait list with `acquired == false`. Fast-exits on the cached
/// earliest deadline.
pub fn timed_refresh() {
    let now = hal::timestamp();
    if now < EARLIEST_DEADLINE.load(Ordering::Relaxed) {
        return;
    }

    let mut timed = TIMED_WAITERS.lock();
    loop {
        let head = match timed.front() {
            Some(head) => Arc::clone(head),
            None => break,
        };

        let channel = {
            let mut sched_state = head.lock_object();
            if sched_state.block.timeout_until > now {
                break;
            }
            sched_state.block.acquired = false;
            sched_state.block.timeout_until = 0;
            sched_state.block.on_timed_queue = false;
            sched_state.block.waiting_on.take()
        };
        timed_remove(&mut timed, &head);

        match channel {
            Some(WaitChannel::Mutex(mutex)) => {
                if let Some(mutex) = mutex.upgrade() {
                    mutex.lock().remove_waiter(&head);
                }
            }
            Some(WaitChannel::Semaphore(semaphore)) => {
                if let Some(semaphore) = semaphore.upgrade() {
                    let mut state = semaphore.lock();
                    state.remove_waiter(&head);
                    // The next head may be satisfiable already.
                    state.process_waiters(&mut timed);
                }
            }
            Some(WaitChannel::RwLock(rwlock)) => {
                if let Some(rwlock) = rwlock.upgrade() {
                    let mut state = rwlock.lock();
                    state.remove_waiter(&head);
                    state.process_waiters(&mut timed);
                }
            }
            None => {}
        }

        sched::unblock(&head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::sched::testing;
    use crate::ke::task::{self, PrivilegeLevel, TaskState};
    use crate::ke::test_support;

    fn noop(_: usize) {}

    fn new_task(name: &str) -> Arc<Task> {
        task::create_process_raw(name, None, PrivilegeLevel::Kernel, noop, 0).unwrap()
    }

    /// Make the calling test thread run as `task` on its CPU.
    fn run_as(task: &Arc<Task>) {
        testing::install_current(hal::current_cpu(), task);
    }

    /// A blocking acquire ends in a yield; give the scheduler something to
    /// switch to.
    fn park_filler() -> Arc<Task> {
        let filler = new_task("filler");
        sched::enable(&filler).unwrap();
        filler
    }

    fn destroy(tasks: &[&Arc<Task>]) {
        for task in tasks {
            testing::remove_from_ready(task);
            task::destroy_tcb(task);
        }
    }

    #[test]
    fn mutex_recursion_releases_k_times() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let owner = new_task("owner");
        run_as(&owner);

        let mutex = Mutex::new();
        assert!(mutex.acquire(NO_TIMEOUT));
        assert!(mutex.acquire(NO_TIMEOUT));
        assert!(mutex.acquire(NO_TIMEOUT));

        mutex.release();
        mutex.release();
        assert!(mutex.owner().is_some(), "still held after 2 of 3 releases");
        mutex.release();
        assert!(mutex.owner().is_none());

        testing::clear_cpu(cpu);
        destroy(&[&owner]);
    }

    #[test]
    fn contended_mutex_hands_off_fifo() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let first = new_task("first");
        let second = new_task("second");
        let filler = park_filler();
        let mutex = Mutex::new();

        run_as(&first);
        assert!(mutex.acquire(NO_TIMEOUT));

        // `second` contends and blocks; the switch away happens inside.
        run_as(&second);
        mutex.acquire(NO_TIMEOUT);
        assert_eq!(second.lock_object().state, TaskState::Waiting);

        // Release as `first`: ownership moves to the queued waiter.
        run_as(&first);
        mutex.release();
        assert!(Arc::ptr_eq(&mutex.owner().unwrap(), &second));
        {
            let sched_state = second.lock_object();
            assert!(sched_state.block.acquired);
            assert_eq!(sched_state.state, TaskState::ReadyToRun);
        }

        testing::clear_cpu(cpu);
        destroy(&[&first, &second, &filler]);
    }

    #[test]
    fn mutex_no_wait_fails_fast() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let holder = new_task("holder");
        let prober = new_task("prober");
        let mutex = Mutex::new();

        run_as(&holder);
        assert!(mutex.acquire(NO_TIMEOUT));
        run_as(&prober);
        assert!(!mutex.acquire(NO_WAIT));
        // The prober was never queued or blocked.
        assert_eq!(prober.lock_object().state, TaskState::Running);

        testing::clear_cpu(cpu);
        destroy(&[&holder, &prober]);
    }

    #[test]
    fn mutex_timeout_expires_with_acquired_false() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let holder = new_task("holder");
        let waiter = new_task("waiter");
        let filler = park_filler();
        let mutex = Mutex::new();

        run_as(&holder);
        assert!(mutex.acquire(NO_TIMEOUT));

        run_as(&waiter);
        mutex.acquire(5_000_000);
        assert_eq!(waiter.lock_object().state, TaskState::Waiting);
        assert_eq!(timed_queue_len_for_tests(), 1);

        hal::advance_clock(5_000_001);
        timed_refresh();

        {
            let sched_state = waiter.lock_object();
            assert!(!sched_state.block.acquired);
            assert!(!sched_state.block.on_timed_queue);
            assert!(sched_state.block.waiting_on.is_none());
            assert_eq!(sched_state.state, TaskState::ReadyToRun);
        }
        // Still owned by the holder; the expired waiter left the wait list,
        // so the release leaves the mutex free.
        assert!(Arc::ptr_eq(&mutex.owner().unwrap(), &holder));
        run_as(&holder);
        mutex.release();
        assert!(mutex.owner().is_none());

        testing::clear_cpu(cpu);
        destroy(&[&holder, &waiter, &filler]);
    }

    #[test]
    fn semaphore_head_of_line_blocks_later_small_requests() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        // Everything held: nothing available until released.
        let semaphore = Semaphore::new(3, 3);
        let big = new_task("big");
        let small = new_task("small");
        let filler = park_filler();

        run_as(&big);
        semaphore.acquire(2, NO_TIMEOUT);
        assert_eq!(big.lock_object().state, TaskState::Waiting);

        testing::make_ready(&filler);
        run_as(&small);
        semaphore.acquire(1, NO_TIMEOUT);
        assert_eq!(small.lock_object().state, TaskState::Waiting);

        // One unit back: enough for `small`, but it must not overtake.
        semaphore.release(1);
        assert_eq!(big.lock_object().state, TaskState::Waiting);
        assert_eq!(small.lock_object().state, TaskState::Waiting);

        // Second unit: the head gets both units at once.
        semaphore.release(1);
        assert!(big.lock_object().block.acquired);
        assert_eq!(small.lock_object().state, TaskState::Waiting);
        assert_eq!(semaphore.held_units(), 3);

        // Head done: the queued small request follows.
        semaphore.release(2);
        assert!(small.lock_object().block.acquired);
        assert_eq!(semaphore.held_units(), 2);

        testing::clear_cpu(cpu);
        destroy(&[&big, &small, &filler]);
    }

    #[test]
    fn semaphore_rejects_oversized_requests() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);
        let caller = new_task("caller");
        run_as(&caller);

        let semaphore = Semaphore::new(0, 2);
        assert!(!semaphore.acquire(3, NO_TIMEOUT));

        testing::clear_cpu(cpu);
        destroy(&[&caller]);
    }

    #[test]
    fn semaphore_uncontended_acquire_takes_units() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);
        let caller = new_task("caller");
        run_as(&caller);

        let semaphore = Semaphore::new(0, 4);
        assert!(semaphore.acquire(3, NO_TIMEOUT));
        assert_eq!(semaphore.held_units(), 3);
        semaphore.release(3);
        assert_eq!(semaphore.held_units(), 0);

        testing::clear_cpu(cpu);
        destroy(&[&caller]);
    }

    #[test]
    fn rwlock_readers_share_writers_exclude() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);
        let caller = new_task("caller");
        run_as(&caller);

        let rwlock = RwLock::new();
        assert!(rwlock.acquire(false, NO_TIMEOUT));
        assert!(rwlock.acquire(false, NO_TIMEOUT));
        assert_eq!(rwlock.reader_count(), 2);
        assert!(!rwlock.acquire(true, NO_WAIT));
        rwlock.release();
        rwlock.release();

        assert!(rwlock.acquire(true, NO_TIMEOUT));
        assert!(rwlock.has_writer());
        assert!(!rwlock.acquire(false, NO_WAIT));
        rwlock.release();

        testing::clear_cpu(cpu);
        destroy(&[&caller]);
    }

    #[test]
    fn rwlock_readers_do_not_overtake_waiting_writer() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        testing::clear_cpu(cpu);

        let holder = new_task("holder");
        let writer = new_task("writer");
        let reader = new_task("reader");
        let filler = park_filler();
        let rwlock = RwLock::new();

        run_as(&holder);
        assert!(rwlock.acquire(false, NO_TIMEOUT));

        run_as(&writer);
        rwlock.acquire(true, NO_TIMEOUT);
        assert_eq!(writer.lock_object().state, TaskState::Waiting);

        // A reader arriving behind the queued writer must queue too, even
        // though the lock is only read-held right now.
        testing::make_ready(&filler);
        run_as(&reader);
        rwlock.acquire(false, NO_TIMEOUT);
        assert_eq!(reader.lock_object().state, TaskState::Waiting);

        // Holder leaves: the writer is admitted alone.
        run_as(&holder);
        rwlock.release();
        assert!(writer.lock_object().block.acquired);
        assert!(rwlock.has_writer());
        assert_eq!(reader.lock_object().state, TaskState::Waiting);

        // Writer leaves: the queued reader follows.
        run_as(&writer);
        rwlock.release();
        assert!(reader.lock_object().block.acquired);
        assert_eq!(rwlock.reader_count(), 1);

        testing::clear_cpu(cpu);
        destroy(&[&holder, &writer, &reader, &filler]);
    }

    #[test]
    #[should_panic(expected = "UnacquiredMutexReleased")]
    fn releasing_a_free_mutex_panics() {
        let mutex = Mutex::new();
        mutex.release();
    }

    #[test]
    #[should_panic(expected = "UnacquiredMutexReleased")]
    fn releasing_more_semaphore_units_than_held_panics() {
        let semaphore = Semaphore::new(1, 4);
        semaphore.release(2);
    }

    fn timed_queue_len_for_tests() -> usize {
        TIMED_WAITERS.lock().len()
    }
}
