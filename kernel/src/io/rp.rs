//! Request Packets.
//!
//! The unit of communication between the kernel and device stacks. An RP is
//! dispatched to a driver, which either finalizes it inline or files it on a
//! per-device [`RpQueue`]; queued RPs run strictly in start order and only
//! the queue head may be finalized. Cancelling is possible for any queued RP
//! except the executing head.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::io::dev::DeviceObject;
use crate::io::res::{BusId, BusType, DeviceResource};
use crate::ke::panic::{panic_ex, PanicCode};
use crate::ke::prio::{self, PriorityLevel};
use crate::ke::task::{BlockReason, Task};
use crate::ke::{sched, SpinLock};
use crate::mm::slab::ObjectCache;
use crate::ob::{KernelObject, Lockable, ObjectHeader, ObjectType};
use crate::status::{Result, Status};

/// Request codes, wire-compatible with driver images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum RpCode {
    #[default]
    Unknown = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Ioctl = 5,

    StartDevice = 0x1000,
    GetDeviceId = 0x1001,
    GetDeviceText = 0x1002,
    Enumerate = 0x1003,
    GetDeviceLocation = 0x1004,
    GetDeviceResources = 0x1005,
    GetConfigSpace = 0x1006,
    SetConfigSpace = 0x1007,

    StorageControl = 0x2000,
    FilesystemControl = 0x2001,
    DiskControl = 0x2002,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpFlags: u32 {
        /// Read ended early at end of medium; `size` holds the actual count.
        const END_OF_FILE = 1 << 0;
    }
}

/// Operation-specific payload.
#[derive(Default)]
pub enum RpPayload {
    #[default]
    None,
    Read {
        offset: u64,
    },
    Write {
        offset: u64,
    },
    DeviceId {
        main: Option<String>,
        compatible: Vec<String>,
    },
    DeviceText(Option<String>),
    Location(Option<(BusType, BusId)>),
    Resources(Vec<DeviceResource>),
    ConfigSpace {
        offset: u64,
        buffer: Vec<u8>,
    },
    Ioctl {
        code: u32,
        data: Vec<u8>,
    },
    DeviceControl {
        code: u32,
        data: Vec<u8>,
    },
}

pub type RpCompletionCallback = fn(&Arc<Rp>, usize);
pub type RpCancelCallback = fn(&Arc<Rp>);
pub type RpProcessCallback = fn(&Arc<Rp>);

pub struct RpState {
    pub device: Option<Arc<DeviceObject>>,
    pub code: RpCode,
    pub flags: RpFlags,
    pub system_buffer: Vec<u8>,
    /// Raw user-space address, validated by the initiator.
    pub user_buffer: usize,
    pub size: u64,
    pub status: core::result::Result<(), Status>,
    pub task: Option<Arc<Task>>,
    pub payload: RpPayload,
    pub completion: Option<(RpCompletionCallback, usize)>,
    pub cancel: Option<RpCancelCallback>,
    queue: Option<Weak<RpQueue>>,
}

impl Default for RpState {
    fn default() -> RpState {
        RpState {
            device: None,
            code: RpCode::Unknown,
            flags: RpFlags::empty(),
            system_buffer: Vec::new(),
            user_buffer: 0,
            size: 0,
            status: Ok(()),
            task: None,
            payload: RpPayload::None,
            completion: None,
            cancel: None,
            queue: None,
        }
    }
}

pub struct Rp {
    header: ObjectHeader,
    pub state: SpinLock<RpState>,
    pending: AtomicBool,
}

impl KernelObject for Rp {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for Rp {
    type Guarded = RpState;

    fn object_lock(&self) -> &SpinLock<RpState> {
        &self.state
    }
}

impl Rp {
    fn new() -> Rp {
        Rp {
            header: ObjectHeader::new(ObjectType::Rp),
            state: SpinLock::new(RpState::default()),
            pending: AtomicBool::new(false),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn code(&self) -> RpCode {
        self.state.lock().code
    }

    pub fn device(&self) -> Option<Arc<DeviceObject>> {
        self.state.lock().device.clone()
    }
}

const RP_CACHE_SIZE: usize = 64;
static RP_CACHE: ObjectCache<Rp> = ObjectCache::new(RP_CACHE_SIZE);

/// Allocate an empty Request Packet from the cache.
pub fn create_rp() -> Arc<Rp> {
    let rp = RP_CACHE.take_or(Rp::new);
    *rp.state.lock() = RpState::default();
    rp.pending.store(false, Ordering::SeqCst);
    rp
}

/// Return a Request Packet to the cache once the caller is done with it.
pub fn free_rp(rp: Arc<Rp>) {
    RP_CACHE.put(rp);
}

/// Duplicate an RP for forwarding; linkage and queue state start fresh.
pub fn clone_rp(rp: &Arc<Rp>) -> Arc<Rp> {
    let copy = create_rp();
    {
        let source = rp.state.lock();
        let mut target = copy.state.lock();
        target.device = source.device.clone();
        target.code = source.code;
        target.flags = source.flags;
        target.system_buffer = source.system_buffer.clone();
        target.user_buffer = source.user_buffer;
        target.size = source.size;
        target.status = source.status;
        target.task = source.task.clone();
    }
    copy
}

struct RpQueueState {
    queue: alloc::collections::VecDeque<Arc<Rp>>,
    busy: bool,
}

/// Serializes RPs for one device context.
pub struct RpQueue {
    process: RpProcessCallback,
    state: SpinLock<RpQueueState>,
}

pub fn create_rp_queue(process: RpProcessCallback) -> Arc<RpQueue> {
    Arc::new(RpQueue {
        process,
        state: SpinLock::new(RpQueueState {
            queue: alloc::collections::VecDeque::new(),
            busy: false,
        }),
    })
}

/// Append an RP; an idle queue starts processing it immediately.
pub fn start_rp(queue: &Arc<RpQueue>, rp: &Arc<Rp>, cancel: Option<RpCancelCallback>) -> Result {
    {
        let mut state = rp.state.lock();
        state.cancel = cancel;
        state.queue = Some(Arc::downgrade(queue));
    }
    let run_now = {
        let mut qstate = queue.state.lock();
        qstate.queue.push_back(Arc::clone(rp));
        if !qstate.busy {
            qstate.busy = true;
            true
        } else {
            false
        }
    };
    if run_now {
        (queue.process)(rp);
    }
    Ok(())
}

/// Complete an RP: run the completion callback, hand the queue to the next
/// RP, wake a waiting task. Only the head of a queue may be finalized.
pub fn finalize_rp(rp: &Arc<Rp>) -> Result {
    let queue = rp.state.lock().queue.clone().and_then(|q| q.upgrade());
    let completion = rp.state.lock().completion;

    match queue {
        Some(queue) => {
            {
                let qstate = queue.state.lock();
                let is_head = qstate
                    .queue
                    .front()
                    .map(|head| Arc::ptr_eq(head, rp))
                    .unwrap_or(false);
                if !is_head {
                    panic_ex(
                        PanicCode::RpFinalizedOutOfLine,
                        [Arc::as_ptr(rp) as usize, 0, 0, 0],
                    );
                }
            }
            if let Some((callback, context)) = completion {
                callback(rp, context);
            }

            let next = {
                let mut qstate = queue.state.lock();
                qstate.queue.pop_front();
                match qstate.queue.front() {
                    Some(next) => Some(Arc::clone(next)),
                    None => {
                        qstate.busy = false;
                        None
                    }
                }
            };
            rp.state.lock().queue = None;
            if let Some(next) = next {
                (queue.process)(&next);
            }
        }
        None => {
            if let Some((callback, context)) = completion {
                callback(rp, context);
            }
        }
    }

    {
        let _exclusive = prio::raise(PriorityLevel::EXCLUSIVE);
        if rp.pending.swap(false, Ordering::SeqCst) {
            if let Some(task) = rp.state.lock().task.clone() {
                sched::unblock(&task);
            }
        }
    }

    // With a completion callback registered the RP is released here;
    // otherwise the initiator still owns it.
    if completion.is_some() {
        free_rp(Arc::clone(rp));
    }

    Ok(())
}

/// Cancel a queued RP. The executing head cannot be cancelled.
pub fn cancel_rp(rp: &Arc<Rp>) -> Result {
    let queue = match rp.state.lock().queue.clone().and_then(|q| q.upgrade()) {
        Some(queue) => queue,
        None => return Err(Status::RpNotCancellable),
    };

    {
        let mut qstate = queue.state.lock();
        let position = qstate.queue.iter().position(|t| Arc::ptr_eq(t, rp));
        match position {
            None | Some(0) => return Err(Status::RpNotCancellable),
            Some(position) => {
                qstate.queue.remove(position);
            }
        }
    }
    rp.state.lock().queue = None;

    let cancel = rp.state.lock().cancel;
    if let Some(cancel) = cancel {
        cancel(rp);
    }
    Ok(())
}

/// Mark an RP as not immediately completable; the initiator may then block
/// in [`wait_for_completion`] until `finalize_rp` runs.
pub fn mark_pending(rp: &Arc<Rp>) {
    rp.pending.store(true, Ordering::SeqCst);
}

/// Block until the RP completes. Must only be called after a successful
/// send.
pub fn wait_for_completion(rp: &Arc<Rp>) {
    loop {
        let elevated = prio::raise(PriorityLevel::EXCLUSIVE);
        if rp.is_pending() {
            if let Some(task) = rp.state.lock().task.clone() {
                sched::block(&task, BlockReason::Io);
            }
            drop(elevated);
            sched::yield_now();
        } else {
            drop(elevated);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::SpinLock;
    use alloc::vec::Vec;

    static PROCESSED: SpinLock<Vec<usize>> = SpinLock::new(Vec::new());
    static CANCELLED: SpinLock<Vec<usize>> = SpinLock::new(Vec::new());
    static COMPLETED: SpinLock<Vec<usize>> = SpinLock::new(Vec::new());

    fn tag_of(rp: &Arc<Rp>) -> usize {
        rp.state.lock().user_buffer
    }

    fn recording_process(rp: &Arc<Rp>) {
        PROCESSED.lock().push(tag_of(rp));
    }

    fn recording_cancel(rp: &Arc<Rp>) {
        CANCELLED.lock().push(tag_of(rp));
    }

    fn recording_completion(rp: &Arc<Rp>, context: usize) {
        COMPLETED.lock().push(context);
        let _ = rp;
    }

    fn tagged_rp(tag: usize) -> Arc<Rp> {
        let rp = create_rp();
        rp.state.lock().user_buffer = tag;
        rp
    }

    #[test]
    fn queue_processes_in_start_order_one_at_a_time() {
        let queue = create_rp_queue(recording_process);
        let first = tagged_rp(101);
        let second = tagged_rp(102);
        let third = tagged_rp(103);

        start_rp(&queue, &first, None).unwrap();
        // The idle queue ran the head inline; the rest are parked.
        assert_eq!(PROCESSED.lock().iter().filter(|t| **t == 101).count(), 1);

        start_rp(&queue, &second, None).unwrap();
        start_rp(&queue, &third, None).unwrap();
        assert!(!PROCESSED.lock().contains(&102));

        finalize_rp(&first).unwrap();
        assert!(PROCESSED.lock().contains(&102));
        assert!(!PROCESSED.lock().contains(&103));

        finalize_rp(&second).unwrap();
        assert!(PROCESSED.lock().contains(&103));
        finalize_rp(&third).unwrap();

        // Queue is idle again: a fresh RP starts inline.
        let fourth = tagged_rp(104);
        start_rp(&queue, &fourth, None).unwrap();
        assert!(PROCESSED.lock().contains(&104));
        finalize_rp(&fourth).unwrap();
    }

    #[test]
    fn cancel_refuses_the_head_and_unlinks_others() {
        let queue = create_rp_queue(recording_process);
        let head = tagged_rp(201);
        let middle = tagged_rp(202);
        let tail = tagged_rp(203);

        start_rp(&queue, &head, Some(recording_cancel)).unwrap();
        start_rp(&queue, &middle, Some(recording_cancel)).unwrap();
        start_rp(&queue, &tail, Some(recording_cancel)).unwrap();

        // The head is executing: not cancellable.
        assert_eq!(cancel_rp(&head), Err(Status::RpNotCancellable));

        assert_eq!(cancel_rp(&middle), Ok(()));
        assert_eq!(CANCELLED.lock().iter().filter(|t| **t == 202).count(), 1);

        // Cancelling again fails: the RP is no longer queued.
        assert_eq!(cancel_rp(&middle), Err(Status::RpNotCancellable));

        // The cancelled RP is never processed; the queue moves head → tail.
        finalize_rp(&head).unwrap();
        assert!(PROCESSED.lock().contains(&203));
        assert!(!PROCESSED.lock().contains(&202));
        finalize_rp(&tail).unwrap();
    }

    #[test]
    #[should_panic(expected = "RpFinalizedOutOfLine")]
    fn finalizing_a_non_head_rp_panics() {
        let queue = create_rp_queue(recording_process);
        let head = tagged_rp(301);
        let parked = tagged_rp(302);
        start_rp(&queue, &head, None).unwrap();
        start_rp(&queue, &parked, None).unwrap();
        let _ = finalize_rp(&parked);
    }

    #[test]
    fn completion_callback_runs_before_release() {
        let queue = create_rp_queue(recording_process);
        let rp = tagged_rp(401);
        rp.state.lock().completion = Some((recording_completion, 4242));
        start_rp(&queue, &rp, None).unwrap();
        finalize_rp(&rp).unwrap();
        assert!(COMPLETED.lock().contains(&4242));
    }

    #[test]
    fn unqueued_rp_finalizes_standalone() {
        let rp = tagged_rp(501);
        rp.state.lock().status = Err(Status::RpProcessingFailed);
        finalize_rp(&rp).unwrap();
        assert_eq!(rp.state.lock().status, Err(Status::RpProcessingFailed));
        free_rp(rp);
    }

    #[test]
    fn pending_flag_round_trip() {
        let rp = tagged_rp(601);
        assert!(!rp.is_pending());
        mark_pending(&rp);
        assert!(rp.is_pending());
        // No task recorded: finalize just clears the flag.
        finalize_rp(&rp).unwrap();
        assert!(!rp.is_pending());
        free_rp(rp);
    }

    #[test]
    fn clone_rp_copies_request_but_not_linkage() {
        let queue = create_rp_queue(recording_process);
        let original = tagged_rp(701);
        {
            let mut state = original.state.lock();
            state.code = RpCode::Read;
            state.size = 512;
        }
        start_rp(&queue, &original, None).unwrap();

        let copy = clone_rp(&original);
        {
            let state = copy.state.lock();
            assert_eq!(state.code, RpCode::Read);
            assert_eq!(state.size, 512);
            assert_eq!(state.user_buffer, 701);
            assert!(state.queue.is_none());
        }
        finalize_rp(&original).unwrap();
        free_rp(copy);
    }
}
