//! Kern subsystem - blocking synchronization primitives
//!
//! Contains the dispatch lock, wait queues, and the sleeping mutex built on
//! top of them.

pub mod dispatch;
pub mod mutex;
pub mod priority;
pub mod sched_prim;

pub use dispatch::{dispatch_lock, DispatchGuard};
pub use mutex::Mutex;
pub use priority::Priority;
pub use sched_prim::{Deadline, ResourceOwnership, WaitQueue, WaitResult};

/// Initialize the kern subsystem
pub fn init() {
    sched_prim::init();
}
