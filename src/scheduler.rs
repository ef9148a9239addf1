//! Scheduler adapter
//!
//! The narrow slice of a thread subsystem that the blocking primitives in
//! [`kern`](crate::kern) consume: a table of schedulable threads, the
//! current-thread binding, run-state transitions, and suspend/resume.
//!
//! The adapter models an SMP system: a thread suspends by spinning on its
//! own run-state until a waker on another CPU marks it ready. A full
//! scheduler would context-switch to another thread at that point instead;
//! nothing in the wait-queue or mutex layer depends on which of the two
//! happens, only on the ready/blocked transitions visible here.
//!
//! Run-state fields are single atomics, but every composite transition
//! (blocked-with-back-reference, dequeue-and-deliver-result) happens with
//! the dispatch lock held so that a waker can never observe a half-recorded
//! wait.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::kern::dispatch::DispatchGuard;
use crate::kern::priority::Priority;
use crate::kern::sched_prim::{self, WaitResult};
use crate::types::ThreadId;

// ============================================================================
// Run States
// ============================================================================

/// Thread run-state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    /// Eligible to run, waiting to be selected
    Ready = 0,
    /// Currently executing
    Running = 1,
    /// Parked on a wait queue (or in a handoff window between queues)
    Blocked = 2,
}

impl RunState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => RunState::Ready,
            1 => RunState::Running,
            2 => RunState::Blocked,
            _ => panic!("scheduler: invalid run state {}", raw),
        }
    }
}

// ============================================================================
// Schedulable Thread
// ============================================================================

/// Per-thread record owned by the scheduler
///
/// Wait queues never own these; they hold [`ThreadId`] handles and reach
/// back into the table for state transitions.
#[derive(Debug)]
pub struct SchedThread {
    /// Thread identifier
    pub id: ThreadId,
    /// Scheduling priority
    priority: AtomicI32,
    /// Current run-state
    run_state: AtomicU32,
    /// Address of the wait queue this thread is blocked in (0 = none)
    blocked_on: AtomicUsize,
    /// Incremented at the start of every wait; guards stale timeout delivery
    wait_epoch: AtomicU64,
    /// Status delivered by the most recent waker
    wait_result: AtomicU32,
    /// Times this thread has been woken
    pub wakeups: AtomicU64,
}

impl SchedThread {
    fn new(id: ThreadId, priority: Priority) -> Self {
        Self {
            id,
            priority: AtomicI32::new(priority.value()),
            run_state: AtomicU32::new(RunState::Ready as u32),
            blocked_on: AtomicUsize::new(0),
            wait_epoch: AtomicU64::new(0),
            wait_result: AtomicU32::new(WaitResult::Normal.as_raw()),
            wakeups: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Scheduler Statistics
// ============================================================================

/// Global scheduler statistics
#[derive(Debug)]
pub struct SchedStats {
    /// Suspend/resume round trips completed
    pub context_switches: AtomicU64,
    /// Threads marked ready by wakers
    pub wakeups: AtomicU64,
}

static SCHED_STATS: SchedStats = SchedStats {
    context_switches: AtomicU64::new(0),
    wakeups: AtomicU64::new(0),
};

/// Get global scheduler statistics
pub fn stats() -> &'static SchedStats {
    &SCHED_STATS
}

// ============================================================================
// Thread Table
// ============================================================================

static THREADS: spin::Once<spin::Mutex<BTreeMap<ThreadId, Arc<SchedThread>>>> = spin::Once::new();

fn threads() -> &'static spin::Mutex<BTreeMap<ThreadId, Arc<SchedThread>>> {
    THREADS.call_once(|| spin::Mutex::new(BTreeMap::new()))
}

/// Initialize the scheduler adapter
pub fn init() {
    let _ = threads();
}

/// Create a new schedulable thread with the given priority
pub fn thread_register(priority: Priority) -> ThreadId {
    let id = ThreadId::new();
    let thread = Arc::new(SchedThread::new(id, priority));
    threads().lock().insert(id, thread);
    id
}

/// Find a thread by ID
pub fn thread_find(id: ThreadId) -> Option<Arc<SchedThread>> {
    threads().lock().get(&id).cloned()
}

fn thread_get(id: ThreadId) -> Arc<SchedThread> {
    thread_find(id).unwrap_or_else(|| panic!("scheduler: unknown thread {:?}", id))
}

// ============================================================================
// Current Thread and Interrupt Depth
// ============================================================================

// Under the test harness (or the std feature) each host thread stands in
// for one kernel thread, so the current binding and interrupt depth are
// thread-local. Outside that, this is a single-CPU model with one global
// current slot.
#[cfg(any(test, feature = "std"))]
mod cpu {
    use crate::types::ThreadId;
    use core::cell::Cell;

    std::thread_local! {
        static CURRENT: Cell<ThreadId> = const { Cell::new(ThreadId::NULL) };
        static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
    }

    pub fn current() -> ThreadId {
        CURRENT.with(|c| c.get())
    }

    pub fn set_current(id: ThreadId) {
        CURRENT.with(|c| c.set(id));
    }

    pub fn irq_depth() -> u32 {
        IRQ_DEPTH.with(|d| d.get())
    }

    pub fn irq_adjust(delta: i32) {
        IRQ_DEPTH.with(|d| {
            let depth = d.get() as i32 + delta;
            assert!(depth >= 0, "scheduler: interrupt depth underflow");
            d.set(depth as u32);
        });
    }
}

#[cfg(not(any(test, feature = "std")))]
mod cpu {
    use crate::types::ThreadId;
    use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

    static CURRENT: AtomicU64 = AtomicU64::new(0);
    static IRQ_DEPTH: AtomicI32 = AtomicI32::new(0);

    pub fn current() -> ThreadId {
        ThreadId(CURRENT.load(Ordering::Acquire))
    }

    pub fn set_current(id: ThreadId) {
        CURRENT.store(id.0, Ordering::Release);
    }

    pub fn irq_depth() -> u32 {
        IRQ_DEPTH.load(Ordering::Acquire).max(0) as u32
    }

    pub fn irq_adjust(delta: i32) {
        let depth = IRQ_DEPTH.fetch_add(delta, Ordering::AcqRel) + delta;
        assert!(depth >= 0, "scheduler: interrupt depth underflow");
    }
}

/// Bind the calling execution context to a registered thread
pub fn adopt(id: ThreadId) {
    let thread = thread_get(id);
    thread
        .run_state
        .store(RunState::Running as u32, Ordering::Release);
    cpu::set_current(id);
}

/// Get the calling context's thread handle
///
/// Fatal if no thread has been bound; only bound threads may use the
/// blocking primitives.
pub fn current_thread() -> ThreadId {
    let id = cpu::current();
    if id.is_null() {
        panic!("scheduler: no thread is bound to this execution context");
    }
    id
}

/// Enter interrupt context (blocking becomes fatal until the matching exit)
pub fn irq_enter() {
    cpu::irq_adjust(1);
}

/// Leave interrupt context
pub fn irq_exit() {
    cpu::irq_adjust(-1);
}

/// Whether the calling context is allowed to block
pub fn can_block() -> bool {
    cpu::irq_depth() == 0
}

// ============================================================================
// Priority
// ============================================================================

/// Get a thread's scheduling priority
pub fn priority_of(id: ThreadId) -> Priority {
    Priority::new(thread_get(id).priority.load(Ordering::Relaxed))
}

/// Change a thread's scheduling priority
///
/// If the thread is blocked in a wait queue, its position there is
/// re-sorted to match the new priority.
pub fn set_priority(id: ThreadId, priority: Priority) {
    let thread = thread_get(id);
    let old = thread.priority.swap(priority.value(), Ordering::Relaxed);
    if old != priority.value() {
        sched_prim::priority_changed(id, Priority::new(old));
    }
}

// ============================================================================
// Run-State Transitions
// ============================================================================

/// Get a thread's current run-state
pub fn run_state(id: ThreadId) -> RunState {
    RunState::from_raw(thread_get(id).run_state.load(Ordering::Acquire))
}

/// Record a thread as blocked in the wait queue at `queue_addr`
///
/// Returns the wait epoch for this block, used to invalidate timeouts armed
/// for an earlier wait. The run-state reaches `Blocked` before the dispatch
/// lock is dropped, so a waker on another CPU cannot miss the transition.
pub fn set_blocked(_held: &DispatchGuard, id: ThreadId, queue_addr: usize) -> u64 {
    let thread = thread_get(id);
    thread.blocked_on.store(queue_addr, Ordering::Relaxed);
    thread
        .wait_result
        .store(WaitResult::Normal.as_raw(), Ordering::Relaxed);
    let epoch = thread.wait_epoch.fetch_add(1, Ordering::Relaxed) + 1;
    thread
        .run_state
        .store(RunState::Blocked as u32, Ordering::Release);
    epoch
}

/// Record the outcome of a wait: clear the queue back-reference and store
/// the result the thread will see when it resumes
///
/// The thread stays `Blocked`; the caller decides when it becomes ready.
/// This is the first half of a handoff.
pub fn finish_wait(_held: &DispatchGuard, id: ThreadId, result: WaitResult) {
    let thread = thread_get(id);
    thread.blocked_on.store(0, Ordering::Relaxed);
    thread.wait_result.store(result.as_raw(), Ordering::Relaxed);
}

/// Retarget a blocked thread's queue back-reference (queue-to-queue move)
pub fn retarget_wait(_held: &DispatchGuard, id: ThreadId, queue_addr: usize) {
    thread_get(id)
        .blocked_on
        .store(queue_addr, Ordering::Relaxed);
}

/// Which wait queue the thread is blocked in (0 = none)
pub fn blocked_on(_held: &DispatchGuard, id: ThreadId) -> usize {
    thread_get(id).blocked_on.load(Ordering::Relaxed)
}

/// The thread's current wait epoch
pub fn wait_epoch(id: ThreadId) -> u64 {
    thread_get(id).wait_epoch.load(Ordering::Relaxed)
}

/// Mark a thread eligible to run
pub fn set_ready(id: ThreadId) {
    let thread = thread_get(id);
    thread.wakeups.fetch_add(1, Ordering::Relaxed);
    SCHED_STATS.wakeups.fetch_add(1, Ordering::Relaxed);
    thread
        .run_state
        .store(RunState::Ready as u32, Ordering::Release);
}

/// Make a thread eligible to run and request a scheduling decision
pub fn unblock(id: ThreadId) {
    set_ready(id);
    reschedule();
}

/// Park the calling thread until a waker marks it ready
///
/// Returns the [`WaitResult`] the waker delivered. Must only be called by
/// the thread itself, after its run-state was set to `Blocked` under the
/// dispatch lock.
pub fn suspend_until_resumed(id: ThreadId) -> WaitResult {
    let thread = thread_get(id);
    while thread.run_state.load(Ordering::Acquire) == RunState::Blocked as u32 {
        core::hint::spin_loop();
    }
    thread
        .run_state
        .store(RunState::Running as u32, Ordering::Relaxed);
    SCHED_STATS.context_switches.fetch_add(1, Ordering::Relaxed);
    WaitResult::from_raw(thread.wait_result.load(Ordering::Acquire))
}

// ============================================================================
// Reschedule Requests
// ============================================================================

static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Request an immediate scheduling decision
///
/// The adapter only records the request; the embedder's scheduler honors it
/// at its next opportunity.
pub fn reschedule() {
    NEED_RESCHED.store(true, Ordering::Release);
}

/// Check whether a reschedule has been requested
pub fn should_reschedule() -> bool {
    NEED_RESCHED.load(Ordering::Acquire)
}
