//! Common types used across the crate
//!
//! This module defines shared identifiers to avoid circular dependencies.

use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier
///
/// A non-owning handle into the scheduler's thread table. Id 0 is reserved
/// as the null handle and is never assigned to a real thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// The null thread handle
    pub const NULL: Self = Self(0);

    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_unique() {
        let a = ThreadId::new();
        let b = ThreadId::new();
        assert_ne!(a, b);
        assert!(!a.is_null());
    }

    #[test]
    fn test_null_id() {
        assert!(ThreadId::NULL.is_null());
        assert_eq!(ThreadId::default(), ThreadId::NULL);
    }
}
