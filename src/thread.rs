//! # Thread Control Block
//!
//! Defines the thread model: the lifecycle state machine, the per-thread
//! control block kept in the kernel's thread table, and the opaque
//! [`Thread`] handle handed to application code.
//!
//! Each thread owns a caller-supplied `'static` stack for its whole life.
//! The lowest word of that stack holds [`STACK_GUARD`]; the initial
//! exception frame is built at the top so the first context restore lands
//! in `entry(arg)`.

use crate::arch::cortex_m::init_stack_frame;
use crate::config::STACK_GUARD;

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///   ┌──────────┐     scheduled       ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///     ▲     ▲         preempted           │  │
///     │     └─────────────────────────────┘  │ exit / stack overflow
///     │ resume                   suspend │   ▼
///   ┌───────────┐ ◄──────────────────────┘ ┌─────────┐
///   │ Suspended │                          │ Stopped │ ──► destroy
///   └───────────┘                          └─────────┘
/// ```
///
/// A Ready thread may also be suspended directly. Stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Waiting to be selected by its core's scheduler.
    Ready,
    /// Executing on a core. At most one per core.
    Running,
    /// Parked until resumed.
    Suspended,
    /// Exited (or overflowed its stack). Only destroy is allowed.
    Stopped,
}

// ---------------------------------------------------------------------------
// Thread handle
// ---------------------------------------------------------------------------

/// Opaque handle to a thread.
///
/// Pairs the identifier assigned at creation with the table slot the thread
/// lives in. The handle stays valid until the thread is destroyed; after
/// that, even if the slot is reused, the identifiers no longer match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    pub(crate) id: i32,
    pub(crate) slot: usize,
}

impl Thread {
    /// Identifier assigned at creation.
    pub fn id(&self) -> i32 {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Scheduling and context state of one thread.
pub(crate) struct ThreadControlBlock {
    /// Saved stack pointer. Meaningful only while the thread is not running.
    pub(crate) sp: *mut usize,

    /// Lowest word of the owned stack (holds the guard).
    stack_base: *mut usize,

    /// Stack length in words, guard included.
    stack_words: usize,

    /// Scheduling weight, `1..=MAX_THREAD_PRIORITY`.
    pub(crate) priority: u32,

    pub(crate) state: ThreadState,

    /// Accumulated credit; grows by `priority` every scheduling pass and is
    /// cleared when the thread is selected.
    pub(crate) credit: u32,
}

// SAFETY: the raw pointers refer to a `'static` stack this block owns
// exclusively. TCBs are only touched with the thread-table lock held.
unsafe impl Send for ThreadControlBlock {}

impl ThreadControlBlock {
    /// Take ownership of `stack`, write the guard word and the initial
    /// frame for `entry(arg)` returning into `exit`.
    ///
    /// Returns `None` if the stack cannot hold a frame.
    pub(crate) fn new(
        stack: &'static mut [usize],
        entry: usize,
        arg: usize,
        exit: usize,
        priority: u32,
    ) -> Option<Self> {
        let (guard, usable) = stack.split_first_mut()?;
        *guard = STACK_GUARD;
        let sp_index = init_stack_frame(usable, entry, arg, exit)?;

        let stack_words = stack.len();
        let stack_base = stack.as_mut_ptr();
        Some(Self {
            // Index is into `usable`, which starts one word above the base.
            sp: stack_base.wrapping_add(1 + sp_index),
            stack_base,
            stack_words,
            priority,
            state: ThreadState::Ready,
            credit: 0,
        })
    }

    /// Ready and waiting for a core.
    #[inline]
    pub(crate) fn is_runnable(&self) -> bool {
        self.state == ThreadState::Ready
    }

    /// Whether the guard word at the bottom of the stack is intact.
    pub(crate) fn guard_intact(&self) -> bool {
        // SAFETY: `stack_base` points at the first word of the owned stack.
        unsafe { self.stack_base.read_volatile() == STACK_GUARD }
    }

    /// Total stack size in bytes, guard word included.
    pub(crate) fn stack_size(&self) -> usize {
        self.stack_words * core::mem::size_of::<usize>()
    }

    /// Bytes between the saved stack pointer and the top of the stack.
    pub(crate) fn stack_usage(&self) -> usize {
        let top = self.stack_base.wrapping_add(self.stack_words) as usize;
        top.saturating_sub(self.sp as usize)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::cortex_m::FULL_FRAME_WORDS;

    fn leaked_stack(words: usize) -> &'static mut [usize] {
        Box::leak(vec![0usize; words].into_boxed_slice())
    }

    #[test]
    fn test_tcb_initialization() {
        let tcb = ThreadControlBlock::new(leaked_stack(64), 0x0800_0101, 7, 0x0800_0201, 5).unwrap();
        assert_eq!(tcb.state, ThreadState::Ready);
        assert_eq!(tcb.priority, 5);
        assert_eq!(tcb.credit, 0);
        assert!(tcb.is_runnable());
        assert!(tcb.guard_intact());
        assert_eq!(tcb.stack_size(), 64 * core::mem::size_of::<usize>());
    }

    #[test]
    fn test_initial_usage_is_one_frame() {
        let tcb = ThreadControlBlock::new(leaked_stack(64), 0x0800_0101, 0, 0x0800_0201, 1).unwrap();
        let word = core::mem::size_of::<usize>();
        // Frame plus at most the words lost to aligning the top down.
        assert!(tcb.stack_usage() >= FULL_FRAME_WORDS * word);
        assert!(tcb.stack_usage() < (FULL_FRAME_WORDS + 2) * word);
    }

    #[test]
    fn test_guard_corruption_detected() {
        let stack = leaked_stack(64);
        let base = stack.as_mut_ptr();
        let tcb = ThreadControlBlock::new(stack, 0x0800_0101, 0, 0x0800_0201, 1).unwrap();
        unsafe { base.write_volatile(0) };
        assert!(!tcb.guard_intact());
    }

    #[test]
    fn test_stack_too_small_for_frame() {
        assert!(ThreadControlBlock::new(leaked_stack(8), 0x0800_0101, 0, 0x0800_0201, 1).is_none());
        assert!(ThreadControlBlock::new(leaked_stack(0), 0x0800_0101, 0, 0x0800_0201, 1).is_none());
    }

    #[test]
    fn test_handle_equality_uses_id_and_slot() {
        let a = Thread { id: 10, slot: 0 };
        assert_eq!(a, Thread { id: 10, slot: 0 });
        assert_ne!(a, Thread { id: 11, slot: 0 });
        assert_ne!(a, Thread { id: 10, slot: 1 });
        assert_eq!(a.id(), 10);
    }
}
