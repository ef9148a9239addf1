//! Sleeplock - blocking synchronization primitives for a preemptive kernel
//!
//! This crate provides the sleeping-mutex and wait-queue layer that sits
//! between a spinlock and the scheduler: threads that lose a race for a
//! resource are parked on a priority-ordered wait queue instead of burning
//! cycles, and are handed the resource directly when it is released.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

// Standard library replacement for no_std
extern crate alloc;

// The test harness (and the optional std feature) runs hosted.
#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod types;

// Blocking primitives
pub mod kern;

// Scheduler adapter
pub mod scheduler;

pub use kern::dispatch::{dispatch_lock, DispatchGuard};
pub use kern::mutex::Mutex;
pub use kern::priority::Priority;
pub use kern::sched_prim::{Deadline, ResourceOwnership, WaitQueue, WaitResult};
pub use types::ThreadId;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "sleeplock";

/// Initialize the blocking-primitive subsystem
pub fn init() {
    scheduler::init();
    kern::init();
}
