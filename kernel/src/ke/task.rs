//! Task and process control blocks.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::hal;
use crate::ke::mutex::WaitChannel;
use crate::ke::SpinLock;
use crate::mm::{PhysAddr, VirtAddr};
use crate::ob::{KernelObject, Lockable, ObjectHeader, ObjectType};
use crate::rtl::CpuSet;
use crate::status::{Result, Status};

pub const MINOR_PRIORITY_LIMIT: u8 = 15;
pub const DEFAULT_MINOR_PRIORITY: u8 = 7;
pub const MAX_THREADS_PER_PROCESS: usize = 16;

pub type TaskEntry = fn(usize);

/// Packed argument block handed to a user process's main thread; the
/// bootstrap copies it onto the new user stack as argc/argv/envp.
pub struct TaskArguments {
    pub argc: usize,
    pub envc: usize,
    /// argc + envc NUL-terminated strings, argv entries first.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Uninitialized,
    ReadyToRun,
    Running,
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    NotBlocked,
    Mutex,
    Semaphore,
    RwLock,
    TimedSleep,
    EventSleep,
    Io,
}

/// Major priority doubles as the scheduling policy band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MajorPriority {
    Highest = 0,
    Interactive = 1,
    Normal = 2,
    Background = 3,
    Lowest = 4,
}

pub const MAJOR_PRIORITY_COUNT: usize = 5;
pub const MINOR_PRIORITY_COUNT: usize = MINOR_PRIORITY_LIMIT as usize + 1;

impl MajorPriority {
    pub fn from_index(index: usize) -> MajorPriority {
        match index {
            0 => MajorPriority::Highest,
            1 => MajorPriority::Interactive,
            2 => MajorPriority::Normal,
            3 => MajorPriority::Background,
            _ => MajorPriority::Lowest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,
    User,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        /// Main thread of its process.
        const MAIN = 1 << 0;
        /// Per-CPU idle task; blocking it is a fatal error.
        const IDLE = 1 << 1;
    }
}

/// Per-task wait bookkeeping. Valid only while the task is blocked.
#[derive(Default)]
pub struct BlockState {
    pub waiting_on: Option<WaitChannel>,
    /// Absolute deadline in nanoseconds, 0 when the wait is unbounded.
    pub timeout_until: u64,
    /// Requested semaphore units.
    pub units: u32,
    /// Writer flag for rw-lock waits.
    pub write: bool,
    /// Outcome of the last blocking acquire.
    pub acquired: bool,
    pub on_timed_queue: bool,
    pub on_sleep_queue: bool,
}

/// Scheduler-owned task state, guarded by the task's object lock.
pub struct TaskSched {
    pub state: TaskState,
    pub requested_state: TaskState,
    pub block_reason: BlockReason,
    pub major: MajorPriority,
    pub minor: u8,
    pub affinity: CpuSet,
    pub notified: bool,
    pub flags: TaskFlags,
    pub on_run_queue: bool,
    pub block: BlockState,
}

pub struct Task {
    pub id: TaskId,
    header: ObjectHeader,
    pub name: String,
    pub process: Arc<Process>,
    /// Slot in the process thread-id pool.
    pub thread_id: u8,
    pub sched: SpinLock<TaskSched>,
    pub arch: hal::TaskData,
}

impl KernelObject for Task {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for Task {
    type Guarded = TaskSched;

    fn object_lock(&self) -> &SpinLock<TaskSched> {
        &self.sched
    }
}

pub struct ProcessState {
    pub threads: Vec<Weak<Task>>,
    /// Bitmask of used thread-id slots.
    thread_ids: u16,
    pub parent: Option<Weak<Process>>,
    pub children: Vec<Weak<Process>>,
    /// Base for dynamic user mappings, set by the image loader.
    pub memory_base: VirtAddr,
}

pub struct Process {
    header: ObjectHeader,
    pub path: Option<String>,
    pub privilege: PrivilegeLevel,
    /// Page-table root shared by every thread of the process.
    pub address_space: PhysAddr,
    /// Serializes user-half page table updates of this process.
    pub user_memory_lock: SpinLock<()>,
    pub state: SpinLock<ProcessState>,
}

impl KernelObject for Process {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for Process {
    type Guarded = ProcessState;

    fn object_lock(&self) -> &SpinLock<ProcessState> {
        &self.state
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // The last thread is gone; the user half was already torn down by
        // whoever unmapped it, only the root page remains.
        hal::destroy_address_space(self.address_space);
    }
}

impl Process {
    pub fn main_thread(&self) -> Option<Arc<Task>> {
        self.state
            .lock()
            .threads
            .iter()
            .filter_map(Weak::upgrade)
            .find(|t| t.sched.lock().flags.contains(TaskFlags::MAIN))
    }
}

impl ProcessState {
    fn allocate_thread_id(&mut self) -> Option<u8> {
        let free = (!self.thread_ids).trailing_zeros() as usize;
        if free >= MAX_THREADS_PER_PROCESS {
            return None;
        }
        self.thread_ids |= 1 << free;
        Some(free as u8)
    }

    fn release_thread_id(&mut self, id: u8) {
        self.thread_ids &= !(1 << id);
    }
}

static TASK_TABLE: SpinLock<BTreeMap<TaskId, Arc<Task>>> = SpinLock::new(BTreeMap::new());

/// Allocate a process control block and its address space. The process has
/// no threads yet.
pub fn prepare_pcb(privilege: PrivilegeLevel, path: Option<&str>) -> Result<Arc<Process>> {
    let address_space = hal::create_address_space()?;
    Ok(Arc::new(Process {
        header: ObjectHeader::new(ObjectType::Process),
        path: path.map(String::from),
        privilege,
        address_space,
        user_memory_lock: SpinLock::new(()),
        state: SpinLock::new(ProcessState {
            threads: Vec::new(),
            thread_ids: 0,
            parent: None,
            children: Vec::new(),
            memory_base: 0,
        }),
    }))
}

/// Create a thread of `process`, consuming the lowest free thread-id slot.
/// The task starts `Uninitialized`; it runs only after
/// [`crate::ke::sched::enable`].
pub fn create_thread(
    process: &Arc<Process>,
    name: &str,
    flags: TaskFlags,
    entry: TaskEntry,
    entry_context: usize,
) -> Result<Arc<Task>> {
    let thread_id = {
        let mut state = process.state.lock();
        state.allocate_thread_id().ok_or(Status::OutOfResources)?
    };

    let arch = match hal::TaskData::new(process.address_space, entry, entry_context) {
        Ok(arch) => arch,
        Err(e) => {
            process.state.lock().release_thread_id(thread_id);
            return Err(e);
        }
    };

    let task = Arc::new(Task {
        id: TaskId::new(),
        header: ObjectHeader::new(ObjectType::Task),
        name: String::from(name),
        process: Arc::clone(process),
        thread_id,
        sched: SpinLock::new(TaskSched {
            state: TaskState::Uninitialized,
            requested_state: TaskState::Uninitialized,
            block_reason: BlockReason::NotBlocked,
            major: MajorPriority::Normal,
            minor: DEFAULT_MINOR_PRIORITY,
            affinity: CpuSet::all(),
            notified: false,
            flags,
            on_run_queue: false,
            block: BlockState::default(),
        }),
        arch,
    });

    process.state.lock().threads.push(Arc::downgrade(&task));
    TASK_TABLE.lock().insert(task.id, Arc::clone(&task));
    Ok(task)
}

/// Create a kernel process with its main thread, without the user-image
/// bootstrap.
pub fn create_process_raw(
    name: &str,
    path: Option<&str>,
    privilege: PrivilegeLevel,
    entry: TaskEntry,
    entry_context: usize,
) -> Result<Arc<Task>> {
    let process = prepare_pcb(privilege, path)?;
    create_thread(&process, name, TaskFlags::MAIN, entry, entry_context)
}

pub fn lookup(id: TaskId) -> Option<Arc<Task>> {
    TASK_TABLE.lock().get(&id).cloned()
}

/// Drop a finished task: release its thread-id slot and table entry. Called
/// by the cleanup worker only; the caller guarantees the task is `Finished`.
pub fn destroy_tcb(task: &Arc<Task>) {
    {
        let mut state = task.process.state.lock();
        state.release_thread_id(task.thread_id);
        state
            .threads
            .retain(|t| t.upgrade().map(|t| t.id != task.id).unwrap_or(false));
    }
    TASK_TABLE.lock().remove(&task.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    #[test]
    fn thread_ids_come_from_a_16_slot_pool() {
        let process = prepare_pcb(PrivilegeLevel::Kernel, None).unwrap();
        let mut tasks = Vec::new();
        for i in 0..MAX_THREADS_PER_PROCESS {
            let task = create_thread(&process, "t", TaskFlags::empty(), noop, 0).unwrap();
            assert_eq!(task.thread_id as usize, i);
            tasks.push(task);
        }
        // Pool exhausted.
        assert_eq!(
            create_thread(&process, "t", TaskFlags::empty(), noop, 0).err(),
            Some(Status::OutOfResources)
        );

        // Freeing a slot makes exactly that id available again.
        destroy_tcb(&tasks[5]);
        let replacement = create_thread(&process, "t", TaskFlags::empty(), noop, 0).unwrap();
        assert_eq!(replacement.thread_id, 5);

        for t in tasks.iter().chain(core::iter::once(&replacement)) {
            destroy_tcb(t);
        }
    }

    #[test]
    fn new_tasks_start_uninitialized_with_defaults() {
        let task = create_process_raw("init", None, PrivilegeLevel::Kernel, noop, 0).unwrap();
        {
            let sched = task.sched.lock();
            assert_eq!(sched.state, TaskState::Uninitialized);
            assert_eq!(sched.major, MajorPriority::Normal);
            assert_eq!(sched.minor, DEFAULT_MINOR_PRIORITY);
            assert!(sched.flags.contains(TaskFlags::MAIN));
            assert!(sched.affinity.contains(0));
        }
        assert!(lookup(task.id).is_some());
        destroy_tcb(&task);
        assert!(lookup(task.id).is_none());
    }

    #[test]
    fn threads_share_the_process_address_space() {
        let process = prepare_pcb(PrivilegeLevel::Kernel, None).unwrap();
        let a = create_thread(&process, "a", TaskFlags::empty(), noop, 0).unwrap();
        let b = create_thread(&process, "b", TaskFlags::empty(), noop, 0).unwrap();
        assert_eq!(a.process.address_space, b.process.address_space);
        destroy_tcb(&a);
        destroy_tcb(&b);
    }
}
