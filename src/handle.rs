//! # Handle Identifiers
//!
//! Threads, mutexes and critlocks are identified by an opaque handle: an
//! identifier plus a reference to the backing block the caller supplied.
//! The backing block stores the same identifier. A handle is valid while the
//! two match; destruction overwrites the stored identifier with
//! [`INVALID_ID`], which invalidates every outstanding copy of the handle
//! without touching the memory itself. Re-creating a resource in the same
//! block draws a fresh identifier, so old handles stay invalid.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::config::FIRST_HANDLE_ID;

/// Identifier stored in a destroyed (or never created) backing block.
pub const INVALID_ID: i32 = -1;

/// Monotonic source of handle identifiers for one resource kind.
pub(crate) struct IdGenerator(AtomicI32);

impl IdGenerator {
    pub(crate) const fn new() -> Self {
        Self(AtomicI32::new(FIRST_HANDLE_ID))
    }

    /// Next identifier. Always non-negative; wraps back to zero after
    /// `i32::MAX` identifiers.
    pub(crate) fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed) & i32::MAX
    }
}

/// True if `id` (from a handle) matches the identifier currently stored in
/// the backing block.
#[inline]
pub(crate) fn id_matches(id: i32, stored: &AtomicI32) -> bool {
    id >= 0 && stored.load(Ordering::Acquire) == id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_and_non_negative() {
        let ids = IdGenerator::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a, FIRST_HANDLE_ID);
        assert_ne!(a, b);
        assert!(a >= 0 && b >= 0);
    }

    #[test]
    fn test_wrapped_ids_stay_non_negative() {
        let ids = IdGenerator(AtomicI32::new(i32::MAX));
        assert_eq!(ids.next(), i32::MAX);
        assert_eq!(ids.next(), 0);
    }

    #[test]
    fn test_invalid_id_never_matches() {
        let stored = AtomicI32::new(INVALID_ID);
        assert!(!id_matches(INVALID_ID, &stored));
        stored.store(7, Ordering::Release);
        assert!(id_matches(7, &stored));
        assert!(!id_matches(8, &stored));
    }
}
