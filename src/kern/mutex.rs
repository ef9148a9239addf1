//! Sleeping Mutex
//!
//! An exclusive lock whose losers sleep instead of spinning. The entire
//! uncontended life of the lock is a single compare-and-swap on one state
//! word; only contention touches the dispatch lock and the embedded
//! [`WaitQueue`].
//!
//! Release hands the lock directly to the highest-priority waiter: the new
//! owner is published in the state word before that thread is marked
//! runnable, so a third thread can never slip in and steal the lock between
//! release and the intended wakeup.
//!
//! Mutex waits are deliberately plain: no timeout, no interruption. A
//! thread that blocks on a mutex wakes only because it now owns it; any
//! other wait result here means the kernel's state is no longer trustworthy
//! and is fatal.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::kern::dispatch::{self, DispatchGuard};
use crate::kern::sched_prim::{Deadline, ResourceOwnership, WaitQueue, WaitResult};
use crate::scheduler;
use crate::types::ThreadId;

// ============================================================================
// Lock Word
// ============================================================================

/// Unlocked state word
const UNLOCKED: u64 = 0;

/// Low bit of the state word: set when one or more threads are queued
const QUEUED_BIT: u64 = 1;

/// Decoded view of the one-word lock state
///
/// Encoded as `owner.0 << 1 | queued-bit`, so the whole state fits one
/// atomic word and both fast paths stay a single compare-and-swap. Thread
/// id 0 is never a real thread, so 0 unambiguously means unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockWord {
    Unlocked,
    Owned { owner: ThreadId, queued: bool },
}

impl LockWord {
    fn encode(self) -> u64 {
        match self {
            LockWord::Unlocked => UNLOCKED,
            LockWord::Owned { owner, queued } => {
                debug_assert!(!owner.is_null());
                (owner.0 << 1) | (queued as u64)
            }
        }
    }

    fn decode(raw: u64) -> Self {
        if raw == UNLOCKED {
            LockWord::Unlocked
        } else {
            LockWord::Owned {
                owner: ThreadId(raw >> 1),
                queued: raw & QUEUED_BIT != 0,
            }
        }
    }
}

// ============================================================================
// Mutex
// ============================================================================

/// Validity tag for live mutexes
pub const MUTEX_MAGIC: u32 = u32::from_le_bytes(*b"mutx");

/// A sleeping mutual-exclusion lock
///
/// Constructed unlocked; must be unlocked again before it is destroyed.
/// The lock has a stable address for its whole life: waiters hold
/// references back to the embedded queue.
#[derive(Debug)]
pub struct Mutex {
    /// One-word lock state (see [`LockWord`])
    state: AtomicU64,
    /// Threads sleeping on this lock
    wait_queue: WaitQueue,
    /// Validity tag
    magic: AtomicU32,
}

impl Mutex {
    /// Create a new unlocked mutex
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(UNLOCKED),
            wait_queue: WaitQueue::new(),
            magic: AtomicU32::new(MUTEX_MAGIC),
        }
    }

    /// Re-initialize in place (for mutexes embedded in recycled memory)
    pub fn init(&self) {
        self.wait_queue.init();
        self.state.store(UNLOCKED, Ordering::Relaxed);
        self.magic.store(MUTEX_MAGIC, Ordering::Relaxed);
    }

    /// Retire the mutex; fatal if it is still held
    ///
    /// Destroying an already-destroyed or never-used unlocked mutex is a
    /// no-op.
    pub fn destroy(&self) {
        if self.magic.load(Ordering::Relaxed) != MUTEX_MAGIC {
            return;
        }
        match LockWord::decode(self.state.load(Ordering::Acquire)) {
            LockWord::Unlocked => {}
            LockWord::Owned { owner, .. } => {
                panic!("mutex {:p}: destroyed while held by thread {:?}", self, owner)
            }
        }
        self.wait_queue.destroy();
        self.magic.store(0, Ordering::Relaxed);
    }

    fn check_magic(&self) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != MUTEX_MAGIC {
            panic!("mutex {:p}: bad magic {:#x}", self, magic);
        }
    }

    // === Acquire ===

    /// Acquire the lock, sleeping until it is available
    ///
    /// Fatal misuse: acquiring a lock the calling thread already holds, or
    /// acquiring from interrupt context.
    pub fn acquire(&self) {
        self.check_magic();
        let current = scheduler::current_thread();
        if !scheduler::can_block() {
            panic!(
                "mutex {:p}: acquire by thread {:?} in interrupt context",
                self, current
            );
        }
        let owned = LockWord::Owned {
            owner: current,
            queued: false,
        }
        .encode();
        if self
            .state
            .compare_exchange(UNLOCKED, owned, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.acquire_contended(current, owned);
    }

    fn acquire_contended(&self, current: ThreadId, owned: u64) {
        loop {
            let held = dispatch::dispatch_lock();

            // Re-read under the lock; the word may have changed since the
            // fast path failed.
            let mut raw = self.state.load(Ordering::Relaxed);
            let must_block = loop {
                match LockWord::decode(raw) {
                    LockWord::Unlocked => break false,
                    LockWord::Owned { owner, .. } if owner == current => {
                        panic!(
                            "mutex {:p}: thread {:?} already holds this lock",
                            self, current
                        );
                    }
                    LockWord::Owned { queued: true, .. } => break true,
                    LockWord::Owned {
                        owner,
                        queued: false,
                    } => {
                        let want = LockWord::Owned {
                            owner,
                            queued: true,
                        }
                        .encode();
                        match self.state.compare_exchange(
                            raw,
                            want,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break true,
                            // Lost a race with the fast-path release; re-read.
                            Err(seen) => raw = seen,
                        }
                    }
                }
            };

            if !must_block {
                // Became free while we took the dispatch lock; don't block,
                // go back around through the fast path.
                drop(held);
                if self
                    .state
                    .compare_exchange(UNLOCKED, owned, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            log::trace!(
                "mutex {:p}: thread {:?} contending, going to sleep",
                self,
                current
            );
            // Uninterruptible and without deadline: the only way out of a
            // mutex wait is ownership.
            let result = self.wait_queue.block_etc(
                held,
                Deadline::INFINITE,
                false,
                ResourceOwnership::Exclusive,
            );
            if result != WaitResult::Normal {
                // Mutex waits have no timeout and are uninterruptible by
                // construction; any other result is a broken invariant.
                panic!(
                    "mutex {:p}: wait by thread {:?} returned {:?}",
                    self, current, result
                );
            }
            // Release handed the lock over before waking us.
            debug_assert_eq!(self.holder(), Some(current));
            return;
        }
    }

    /// Acquire the lock only if it is free right now
    ///
    /// A single fast-path attempt; never blocks and never touches the
    /// dispatch lock.
    pub fn try_acquire(&self) -> bool {
        self.check_magic();
        let current = scheduler::current_thread();
        let owned = LockWord::Owned {
            owner: current,
            queued: false,
        }
        .encode();
        self.state
            .compare_exchange(UNLOCKED, owned, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    // === Release ===

    /// Release the lock, waking the highest-priority waiter if any
    ///
    /// Fatal misuse: releasing a lock the calling thread does not hold, or
    /// releasing from interrupt context.
    pub fn release(&self) {
        self.check_magic();
        let current = scheduler::current_thread();
        if !scheduler::can_block() {
            panic!(
                "mutex {:p}: release by thread {:?} in interrupt context",
                self, current
            );
        }
        let owned = LockWord::Owned {
            owner: current,
            queued: false,
        }
        .encode();
        if self
            .state
            .compare_exchange(owned, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        let held = dispatch::dispatch_lock();
        self.release_locked(&held, current, true);
    }

    /// As [`release`](Self::release), for callers already holding the
    /// dispatch lock
    pub fn release_thread_locked(&self, held: &DispatchGuard, reschedule: bool) {
        self.check_magic();
        let current = scheduler::current_thread();
        self.release_locked(held, current, reschedule);
    }

    fn release_locked(&self, held: &DispatchGuard, current: ThreadId, reschedule: bool) {
        match LockWord::decode(self.state.load(Ordering::Relaxed)) {
            LockWord::Unlocked => panic!(
                "mutex {:p}: release by thread {:?} but the lock is not held",
                self, current
            ),
            LockWord::Owned { owner, .. } if owner != current => panic!(
                "mutex {:p}: release by thread {:?} but the owner is {:?}",
                self, current, owner
            ),
            LockWord::Owned { .. } => {}
        }

        match self.wait_queue.dequeue_one_locked(held, WaitResult::Normal) {
            Some(next) => {
                let word = LockWord::Owned {
                    owner: next,
                    queued: !self.wait_queue.is_empty(),
                };
                // Publish the new owner before the waiter becomes runnable;
                // the lock is never observably free during a handoff.
                self.state.store(word.encode(), Ordering::Release);
                log::trace!(
                    "mutex {:p}: handoff from thread {:?} to thread {:?}",
                    self,
                    current,
                    next
                );
                scheduler::set_ready(next);
                if reschedule {
                    scheduler::reschedule();
                }
            }
            None => {
                // Queued flag was stale; nothing to hand off.
                self.state.store(UNLOCKED, Ordering::Release);
            }
        }
    }

    // === Queries ===

    /// The thread currently holding the lock, if any
    pub fn holder(&self) -> Option<ThreadId> {
        match LockWord::decode(self.state.load(Ordering::Acquire)) {
            LockWord::Unlocked => None,
            LockWord::Owned { owner, .. } => Some(owner),
        }
    }

    /// Whether the lock is currently held by anyone
    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::priority::Priority;
    use crate::scheduler::RunState;
    use alloc::sync::Arc;
    use core::cell::UnsafeCell;
    use core::sync::atomic::AtomicBool;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;

    fn adopt_new_thread() -> ThreadId {
        let id = scheduler::thread_register(Priority::default());
        scheduler::adopt(id);
        id
    }

    #[test]
    fn test_lock_word_roundtrip() {
        assert_eq!(LockWord::decode(UNLOCKED), LockWord::Unlocked);
        for queued in [false, true] {
            let word = LockWord::Owned {
                owner: ThreadId(42),
                queued,
            };
            assert_eq!(LockWord::decode(word.encode()), word);
        }
    }

    #[test]
    fn test_uncontended_acquire_release() {
        let me = adopt_new_thread();
        let mutex = Mutex::new();

        assert!(!mutex.is_held());
        mutex.acquire();
        assert_eq!(mutex.holder(), Some(me));

        mutex.release();
        assert!(!mutex.is_held());
    }

    #[test]
    fn test_try_acquire() {
        let me = adopt_new_thread();
        let mutex = Mutex::new();

        assert!(mutex.try_acquire());
        assert_eq!(mutex.holder(), Some(me));
        assert!(!mutex.try_acquire());

        mutex.release();
        assert!(mutex.try_acquire());
        mutex.release();
    }

    #[test]
    fn test_contended_handoff() {
        adopt_new_thread();
        let mutex = Arc::new(Mutex::new());
        let gate = Arc::new(AtomicBool::new(false));

        mutex.acquire();

        let waiter_id = scheduler::thread_register(Priority::default());
        let waiter = {
            let mutex = Arc::clone(&mutex);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                scheduler::adopt(waiter_id);
                mutex.acquire();
                // Hold until the main thread has inspected the handoff.
                while !gate.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                mutex.release();
            })
        };

        while scheduler::run_state(waiter_id) != RunState::Blocked {
            thread::yield_now();
        }

        mutex.release();
        // Ownership moved straight to the waiter, whether or not it has
        // started running yet.
        assert_eq!(mutex.holder(), Some(waiter_id));

        gate.store(true, Ordering::Release);
        waiter.join().unwrap();
        assert!(!mutex.is_held());
    }

    #[test]
    fn test_release_thread_locked_variant() {
        adopt_new_thread();
        let mutex = Arc::new(Mutex::new());
        let gate = Arc::new(AtomicBool::new(false));
        mutex.acquire();

        let waiter_id = scheduler::thread_register(Priority::default());
        let waiter = {
            let mutex = Arc::clone(&mutex);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                scheduler::adopt(waiter_id);
                mutex.acquire();
                while !gate.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                mutex.release();
            })
        };

        while scheduler::run_state(waiter_id) != RunState::Blocked {
            thread::yield_now();
        }

        let held = dispatch::dispatch_lock();
        mutex.release_thread_locked(&held, false);
        assert_eq!(mutex.holder(), Some(waiter_id));
        drop(held);

        gate.store(true, Ordering::Release);
        waiter.join().unwrap();
        assert!(!mutex.is_held());
    }

    struct Counter {
        mutex: Mutex,
        value: UnsafeCell<u64>,
    }

    // SAFETY: value is only touched while mutex is held.
    unsafe impl Sync for Counter {}

    #[test]
    fn test_mutual_exclusion_under_contention() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 250;

        let counter = Arc::new(Counter {
            mutex: Mutex::new(),
            value: UnsafeCell::new(0),
        });

        let workers: alloc::vec::Vec<_> = (0..THREADS)
            .map(|i| {
                let counter = Arc::clone(&counter);
                let id = scheduler::thread_register(Priority::new(8 + i as i32));
                thread::spawn(move || {
                    scheduler::adopt(id);
                    for _ in 0..ROUNDS {
                        counter.mutex.acquire();
                        // SAFETY: inside the critical section.
                        unsafe {
                            *counter.value.get() += 1;
                        }
                        counter.mutex.release();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(!counter.mutex.is_held());
        assert_eq!(
            unsafe { *counter.value.get() },
            THREADS as u64 * ROUNDS
        );
    }

    #[test]
    fn test_mutex_wait_is_uninterruptible() {
        adopt_new_thread();
        let mutex = Arc::new(Mutex::new());
        mutex.acquire();

        let waiter_id = scheduler::thread_register(Priority::default());
        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                scheduler::adopt(waiter_id);
                mutex.acquire();
                mutex.release();
            })
        };

        while scheduler::run_state(waiter_id) != RunState::Blocked {
            thread::yield_now();
        }

        // A mutex wait cannot be cancelled out from under the lock.
        assert!(!crate::kern::sched_prim::unblock_thread(
            waiter_id,
            WaitResult::Interrupted
        ));
        assert_eq!(scheduler::run_state(waiter_id), RunState::Blocked);

        mutex.release();
        waiter.join().unwrap();
        assert!(!mutex.is_held());
    }

    #[test]
    #[should_panic(expected = "already holds this lock")]
    fn test_self_deadlock_is_fatal() {
        adopt_new_thread();
        let mutex = Mutex::new();
        mutex.acquire();
        mutex.acquire();
    }

    #[test]
    fn test_release_by_non_owner_is_fatal() {
        adopt_new_thread();
        let mutex = Arc::new(Mutex::new());
        let locked = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(AtomicBool::new(false));

        let owner_id = scheduler::thread_register(Priority::default());
        let owner = {
            let mutex = Arc::clone(&mutex);
            let locked = Arc::clone(&locked);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                scheduler::adopt(owner_id);
                mutex.acquire();
                locked.store(true, Ordering::Release);
                while !gate.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                mutex.release();
            })
        };

        while !locked.load(Ordering::Acquire) {
            thread::yield_now();
        }

        let result = catch_unwind(AssertUnwindSafe(|| mutex.release()));
        assert!(result.is_err());
        assert_eq!(mutex.holder(), Some(owner_id));

        gate.store(true, Ordering::Release);
        owner.join().unwrap();
        assert!(!mutex.is_held());
    }

    #[test]
    #[should_panic(expected = "in interrupt context")]
    fn test_acquire_in_interrupt_context_is_fatal() {
        adopt_new_thread();
        let mutex = Mutex::new();
        scheduler::irq_enter();
        mutex.acquire();
    }

    #[test]
    #[should_panic(expected = "destroyed while held")]
    fn test_destroy_held_mutex_is_fatal() {
        adopt_new_thread();
        let mutex = Mutex::new();
        mutex.acquire();
        mutex.destroy();
    }

    #[test]
    fn test_destroy_unlocked_is_idempotent() {
        let mutex = Mutex::new();
        mutex.destroy();
        mutex.destroy();
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn test_destroyed_mutex_rejects_use() {
        adopt_new_thread();
        let mutex = Mutex::new();
        mutex.destroy();
        mutex.acquire();
    }
}
