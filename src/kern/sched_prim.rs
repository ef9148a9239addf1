//! Scheduling Primitives - Wait Queues and Thread Blocking
//!
//! Provides the blocking collection underneath every sleeping primitive in
//! the kernel: a wait queue holds threads in priority order while they are
//! suspended, and wakes them with a status code when the event they wait
//! for occurs.
//!
//! All queue mutation happens under the global
//! [dispatch lock](crate::kern::dispatch). A blocking thread is recorded in
//! the queue and marked blocked before that lock is dropped, so a waker on
//! another CPU can never observe the thread as runnable while its entry is
//! missing, and no wakeup can be lost in the gap between "decided to sleep"
//! and "asleep".

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::kern::dispatch::{self, DispatchGuard};
use crate::kern::priority::Priority;
use crate::scheduler;
use crate::types::ThreadId;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation, delivered by whichever path woke the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitResult {
    /// Thread was awakened normally
    Normal = 0,
    /// The wait deadline passed
    TimedOut = 1,
    /// Thread was interrupted out of the wait
    Interrupted = 2,
    /// The awaited object is going away
    Aborted = 3,
}

impl WaitResult {
    pub(crate) fn as_raw(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            0 => WaitResult::Normal,
            1 => WaitResult::TimedOut,
            2 => WaitResult::Interrupted,
            3 => WaitResult::Aborted,
            _ => panic!("invalid wait result {}", raw),
        }
    }
}

// ============================================================================
// Deadlines and the Tick Clock
// ============================================================================

/// Current tick count (advanced by the embedder's timer interrupt)
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Get the current tick count
pub fn current_ticks() -> u64 {
    TICK_COUNT.load(Ordering::SeqCst)
}

/// Advance the tick clock (called by the timer interrupt)
pub fn tick() {
    TICK_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// An absolute point on the tick clock by which a wait must complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(u64);

impl Deadline {
    /// Never expires
    pub const INFINITE: Deadline = Deadline(u64::MAX);

    /// A deadline at an absolute tick value
    pub const fn at(tick: u64) -> Self {
        Deadline(tick)
    }

    /// A deadline `ticks` from now
    pub fn after(ticks: u64) -> Self {
        Deadline(current_ticks().saturating_add(ticks))
    }

    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether the deadline is already due at tick `now`
    pub fn has_passed(self, now: u64) -> bool {
        !self.is_infinite() && self.0 <= now
    }
}

// ============================================================================
// Resource Ownership Tag
// ============================================================================

/// What kind of contention a blocked thread represents
///
/// Carried on the waiter record for layers that implement priority
/// inheritance on top of the queue; nothing at this level reads it beyond
/// storing and reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceOwnership {
    /// Waiting for exclusive access
    #[default]
    Exclusive,
    /// Waiting for shared-read access
    Shared,
}

// ============================================================================
// Waiter Entry
// ============================================================================

/// A blocked thread's entry in a wait queue
#[derive(Debug, Clone)]
struct Waiter {
    /// The waiting thread
    thread: ThreadId,
    /// Priority at enqueue time (re-sorted if it changes mid-wait)
    priority: Priority,
    /// Whether `WaitResult::Interrupted` may be delivered to this wait
    interruptible: bool,
    /// Contention kind, for priority-inheritance layers above
    ownership: ResourceOwnership,
}

/// Insert keeping descending priority order, behind existing equals
fn insert_sorted(waiters: &mut Vec<Waiter>, waiter: Waiter) {
    let pos = waiters
        .iter()
        .position(|w| w.priority < waiter.priority)
        .unwrap_or(waiters.len());
    waiters.insert(pos, waiter);
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Validity tag for live wait queues
pub const WAIT_QUEUE_MAGIC: u32 = u32::from_le_bytes(*b"wait");

/// A priority-ordered queue of blocked threads
///
/// Highest priority dequeues first, FIFO among equal priorities. Embedded
/// inside owning objects (a mutex, a message port); its address must stay
/// stable while any thread is enqueued, which the fatal non-empty destroy
/// enforces.
#[derive(Debug)]
pub struct WaitQueue {
    /// Validity tag
    magic: AtomicU32,
    /// Number of enqueued waiters; advisory when read without the dispatch lock
    count: AtomicUsize,
    /// Sorted waiter list, guarded by the dispatch lock
    waiters: UnsafeCell<Vec<Waiter>>,
}

// SAFETY: the waiter vector is only touched with the global dispatch lock
// held; everything else is atomic.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    /// Create a new empty wait queue
    pub const fn new() -> Self {
        Self {
            magic: AtomicU32::new(WAIT_QUEUE_MAGIC),
            count: AtomicUsize::new(0),
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// Re-initialize in place (for queues embedded in recycled memory)
    pub fn init(&self) {
        let held = dispatch::dispatch_lock();
        self.waiters_mut(&held).clear();
        self.count.store(0, Ordering::Relaxed);
        self.magic.store(WAIT_QUEUE_MAGIC, Ordering::Relaxed);
    }

    /// Retire the queue; fatal if any thread is still enqueued
    ///
    /// Destroying an already-destroyed or never-used empty queue is a no-op.
    pub fn destroy(&self) {
        let held = dispatch::dispatch_lock();
        if self.magic.load(Ordering::Relaxed) != WAIT_QUEUE_MAGIC {
            return;
        }
        let remaining = self.waiters_ref(&held).len();
        if remaining != 0 {
            panic!("wait queue {:p}: destroyed with {} waiters", self, remaining);
        }
        self.magic.store(0, Ordering::Relaxed);
    }

    fn check_magic(&self) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != WAIT_QUEUE_MAGIC {
            panic!("wait queue {:p}: bad magic {:#x}", self, magic);
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn waiters_mut(&self, _held: &DispatchGuard) -> &mut Vec<Waiter> {
        // SAFETY: the dispatch lock serializes every access to the list; the
        // guard parameter proves the caller holds it.
        unsafe { &mut *self.waiters.get() }
    }

    fn waiters_ref(&self, _held: &DispatchGuard) -> &Vec<Waiter> {
        // SAFETY: as in waiters_mut.
        unsafe { &*self.waiters.get() }
    }

    // === Blocking ===

    /// Block the calling thread on this queue until woken or `deadline`
    ///
    /// Equivalent to [`block_etc`](Self::block_etc) with an interruptible,
    /// exclusive-contention wait.
    pub fn block(&self, held: DispatchGuard, deadline: Deadline) -> WaitResult {
        self.block_etc(held, deadline, true, ResourceOwnership::Exclusive)
    }

    /// Block the calling thread on this queue
    ///
    /// Inserts the caller in priority order, marks it blocked, drops the
    /// dispatch lock and suspends. Returns the status the waker delivered,
    /// or `TimedOut` immediately (without ever suspending) when `deadline`
    /// has already passed.
    ///
    /// `interruptible` permits `WaitResult::Interrupted` delivery through
    /// [`unblock_thread`]; `ownership` tags the contention kind for
    /// priority-inheritance layers above this one.
    pub fn block_etc(
        &self,
        held: DispatchGuard,
        deadline: Deadline,
        interruptible: bool,
        ownership: ResourceOwnership,
    ) -> WaitResult {
        self.check_magic();
        let current = scheduler::current_thread();
        if !scheduler::can_block() {
            panic!(
                "wait queue {:p}: thread {:?} blocking in interrupt context",
                self, current
            );
        }
        if deadline.has_passed(current_ticks()) {
            return WaitResult::TimedOut;
        }

        let priority = scheduler::priority_of(current);
        insert_sorted(
            self.waiters_mut(&held),
            Waiter {
                thread: current,
                priority,
                interruptible,
                ownership,
            },
        );
        self.count.fetch_add(1, Ordering::Relaxed);

        // Blocked run-state and back-reference are recorded while the lock
        // is still held; only then may the lock be dropped.
        let epoch = scheduler::set_blocked(&held, current, self as *const _ as usize);
        if !deadline.is_infinite() {
            arm_timeout(current, epoch, deadline);
        }
        log::trace!(
            "wait queue {:p}: thread {:?} blocked at priority {}",
            self,
            current,
            priority.value()
        );
        drop(held);

        scheduler::suspend_until_resumed(current)
    }

    // === Waking ===

    /// Remove the highest-priority waiter and deliver `result` without
    /// making it runnable
    ///
    /// The building block for ownership handoff: the caller publishes
    /// whatever state transfers to the thread, then marks it ready itself.
    pub fn dequeue_one_locked(
        &self,
        held: &DispatchGuard,
        result: WaitResult,
    ) -> Option<ThreadId> {
        self.check_magic();
        let waiters = self.waiters_mut(held);
        if waiters.is_empty() {
            return None;
        }
        let waiter = waiters.remove(0);
        self.count.fetch_sub(1, Ordering::Relaxed);
        scheduler::finish_wait(held, waiter.thread, result);
        Some(waiter.thread)
    }

    /// Wake the highest-priority waiter; returns how many threads woke (0 or 1)
    pub fn wake_one_locked(
        &self,
        held: &DispatchGuard,
        reschedule: bool,
        result: WaitResult,
    ) -> usize {
        match self.dequeue_one_locked(held, result) {
            Some(thread) => {
                log::trace!("wait queue {:p}: waking thread {:?}", self, thread);
                scheduler::set_ready(thread);
                if reschedule {
                    scheduler::reschedule();
                }
                1
            }
            None => 0,
        }
    }

    /// Wake the highest-priority waiter (acquires the dispatch lock)
    pub fn wake_one(&self, reschedule: bool, result: WaitResult) -> usize {
        let held = dispatch::dispatch_lock();
        self.wake_one_locked(&held, reschedule, result)
    }

    /// Wake every waiter in priority order; returns how many threads woke
    pub fn wake_all_locked(
        &self,
        held: &DispatchGuard,
        reschedule: bool,
        result: WaitResult,
    ) -> usize {
        let mut woken = 0;
        while let Some(thread) = self.dequeue_one_locked(held, result) {
            scheduler::set_ready(thread);
            woken += 1;
        }
        if woken > 0 {
            log::trace!("wait queue {:p}: woke {} threads", self, woken);
            if reschedule {
                scheduler::reschedule();
            }
        }
        woken
    }

    /// Wake every waiter (acquires the dispatch lock)
    pub fn wake_all(&self, reschedule: bool, result: WaitResult) -> usize {
        let held = dispatch::dispatch_lock();
        self.wake_all_locked(&held, reschedule, result)
    }

    /// Move the highest-priority waiter of `src` into `dst` without waking it
    ///
    /// The thread stays blocked; its back-reference and sorted position are
    /// recomputed for `dst`. Returns false when `src` is empty. Requeueing a
    /// queue onto itself is a fatal error.
    pub fn requeue_one_locked(src: &WaitQueue, dst: &WaitQueue, held: &DispatchGuard) -> bool {
        src.check_magic();
        dst.check_magic();
        if core::ptr::eq(src, dst) {
            panic!("wait queue {:p}: requeue onto itself", src);
        }
        let waiters = src.waiters_mut(held);
        if waiters.is_empty() {
            return false;
        }
        let waiter = waiters.remove(0);
        src.count.fetch_sub(1, Ordering::Relaxed);
        scheduler::retarget_wait(held, waiter.thread, dst as *const _ as usize);
        log::trace!(
            "wait queue {:p}: thread {:?} requeued to {:p}",
            src,
            waiter.thread,
            dst
        );
        insert_sorted(dst.waiters_mut(held), waiter);
        dst.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Move the highest-priority waiter of `src` into `dst` (acquires the
    /// dispatch lock)
    pub fn requeue_one(src: &WaitQueue, dst: &WaitQueue) -> bool {
        let held = dispatch::dispatch_lock();
        Self::requeue_one_locked(src, dst, &held)
    }

    // === Queries ===

    /// The highest-priority waiter, without removing it
    pub fn peek_locked(&self, held: &DispatchGuard) -> Option<ThreadId> {
        self.check_magic();
        self.waiters_ref(held).first().map(|w| w.thread)
    }

    /// The highest-priority waiter (acquires the dispatch lock)
    pub fn peek(&self) -> Option<ThreadId> {
        let held = dispatch::dispatch_lock();
        self.peek_locked(&held)
    }

    /// The contention tag `thread` blocked with, if it is enqueued here
    pub fn ownership_of_locked(
        &self,
        held: &DispatchGuard,
        thread: ThreadId,
    ) -> Option<ResourceOwnership> {
        self.check_magic();
        self.waiters_ref(held)
            .iter()
            .find(|w| w.thread == thread)
            .map(|w| w.ownership)
    }

    /// Number of enqueued waiters (advisory without the dispatch lock)
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

// ============================================================================
// Unblock by Identity and Priority Rebalancing
// ============================================================================

/// Remove `thread` from whichever queue it is blocked in and wake it with
/// `result`
///
/// Returns false when the thread is not blocked in any queue, or when
/// `result` is `Interrupted` and the wait is uninterruptible.
pub fn unblock_thread(thread: ThreadId, result: WaitResult) -> bool {
    let held = dispatch::dispatch_lock();
    unblock_thread_locked(&held, thread, result)
}

/// As [`unblock_thread`], with the dispatch lock already held
pub fn unblock_thread_locked(held: &DispatchGuard, thread: ThreadId, result: WaitResult) -> bool {
    let addr = scheduler::blocked_on(held, thread);
    if addr == 0 {
        return false;
    }
    // SAFETY: the back-reference is set only while the thread's entry sits
    // in the queue at this address, both mutations happen under the dispatch
    // lock we hold, and a queue is never destroyed or moved while it has
    // waiters (non-empty destroy is fatal). The address therefore refers to
    // a live WaitQueue for the whole critical section.
    let queue = unsafe { &*(addr as *const WaitQueue) };
    queue.check_magic();

    let waiters = queue.waiters_mut(held);
    let pos = match waiters.iter().position(|w| w.thread == thread) {
        Some(pos) => pos,
        None => panic!(
            "wait queue {:p}: thread {:?} has a back-reference but no entry",
            queue, thread
        ),
    };
    if result == WaitResult::Interrupted && !waiters[pos].interruptible {
        return false;
    }
    waiters.remove(pos);
    queue.count.fetch_sub(1, Ordering::Relaxed);
    scheduler::finish_wait(held, thread, result);
    scheduler::unblock(thread);
    log::trace!(
        "wait queue {:p}: thread {:?} unblocked with {:?}",
        queue,
        thread,
        result
    );
    true
}

/// Re-sort `thread` within the queue it is blocked in after its priority
/// changed
///
/// No-op when the thread is not blocked. The thread is placed behind
/// existing waiters of its new priority, so FIFO order within a band is
/// preserved.
pub fn priority_changed(thread: ThreadId, old_priority: Priority) {
    let held = dispatch::dispatch_lock();
    priority_changed_locked(&held, thread, old_priority);
}

/// As [`priority_changed`], with the dispatch lock already held
pub fn priority_changed_locked(held: &DispatchGuard, thread: ThreadId, old_priority: Priority) {
    let addr = scheduler::blocked_on(held, thread);
    if addr == 0 {
        return;
    }
    // SAFETY: as in unblock_thread_locked.
    let queue = unsafe { &*(addr as *const WaitQueue) };
    queue.check_magic();

    let waiters = queue.waiters_mut(held);
    let pos = match waiters.iter().position(|w| w.thread == thread) {
        Some(pos) => pos,
        None => panic!(
            "wait queue {:p}: thread {:?} has a back-reference but no entry",
            queue, thread
        ),
    };
    let mut waiter = waiters.remove(pos);
    waiter.priority = scheduler::priority_of(thread);
    log::trace!(
        "wait queue {:p}: thread {:?} re-sorted, priority {} -> {}",
        queue,
        thread,
        old_priority.value(),
        waiter.priority.value()
    );
    insert_sorted(waiters, waiter);
}

// ============================================================================
// Timeout Delivery
// ============================================================================

struct ArmedTimeout {
    /// Absolute tick at which the wait expires
    deadline: u64,
    thread: ThreadId,
    /// Wait epoch the timeout was armed for; a mismatch means the thread
    /// already woke (and may be in a newer, unrelated wait)
    epoch: u64,
}

static TIMEOUTS: spin::Once<spin::Mutex<Vec<ArmedTimeout>>> = spin::Once::new();

fn timeouts() -> &'static spin::Mutex<Vec<ArmedTimeout>> {
    TIMEOUTS.call_once(|| spin::Mutex::new(Vec::new()))
}

// Lock order: dispatch lock first, then the timeout registry.
fn arm_timeout(thread: ThreadId, epoch: u64, deadline: Deadline) {
    timeouts().lock().push(ArmedTimeout {
        deadline: deadline.0,
        thread,
        epoch,
    });
}

/// Deliver `TimedOut` to every waiter whose deadline has passed
///
/// Called periodically by the embedder's timer path. Returns how many
/// threads were woken.
pub fn check_timeouts() -> usize {
    let now = current_ticks();
    let held = dispatch::dispatch_lock();
    let mut armed = timeouts().lock();
    let mut fired = 0;
    let mut i = 0;
    while i < armed.len() {
        if armed[i].deadline <= now {
            let entry = armed.swap_remove(i);
            if scheduler::wait_epoch(entry.thread) == entry.epoch
                && unblock_thread_locked(&held, entry.thread, WaitResult::TimedOut)
            {
                log::debug!("thread {:?} timed out at tick {}", entry.thread, now);
                fired += 1;
            }
        } else {
            i += 1;
        }
    }
    fired
}

/// Initialize the scheduling-primitive subsystem
pub fn init() {
    let _ = timeouts();
}
