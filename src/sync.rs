//! # Critical Sections
//!
//! Per-core, nesting-counted regions with interrupts masked. Each core owns
//! one counter; interrupts on a core are masked exactly while its counter is
//! non-zero. This never blocks and never fails.
//!
//! A critical section only excludes interrupt handlers and threads on the
//! *same* core. For exclusion against the other core see
//! [`crate::exclusive`].

use core::sync::atomic::{compiler_fence, AtomicU32, Ordering};

use crate::config::CORE_COUNT;
use crate::kernel::Kernel;
use crate::port::Port;

/// Nesting depth of the critical section on each core.
///
/// A counter is only ever touched by its own core, so relaxed atomics are
/// enough; they exist to make the shared kernel object `Sync`.
pub(crate) struct CriticalNesting {
    depth: [AtomicU32; CORE_COUNT],
}

impl CriticalNesting {
    pub(crate) const fn new() -> Self {
        Self {
            depth: [const { AtomicU32::new(0) }; CORE_COUNT],
        }
    }

    pub(crate) fn enter<P: Port>(&self, port: &P) {
        let depth = &self.depth[port.current_core().index()];
        if depth.load(Ordering::Relaxed) == 0 {
            port.disable_interrupts();
        }
        depth.fetch_add(1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    pub(crate) fn exit<P: Port>(&self, port: &P) {
        compiler_fence(Ordering::SeqCst);
        let depth = &self.depth[port.current_core().index()];
        let current = depth.load(Ordering::Relaxed);
        if current > 0 {
            depth.store(current - 1, Ordering::Relaxed);
            if current == 1 {
                port.enable_interrupts();
            }
        }
    }

    pub(crate) fn reset<P: Port>(&self, port: &P) {
        compiler_fence(Ordering::SeqCst);
        self.depth[port.current_core().index()].store(0, Ordering::Relaxed);
        port.enable_interrupts();
    }

    pub(crate) fn is_active<P: Port>(&self, port: &P) -> bool {
        self.depth[port.current_core().index()].load(Ordering::Relaxed) > 0
    }
}

impl<P: Port> Kernel<P> {
    /// Enter a critical section on the calling core, masking its interrupts
    /// on the outermost entry.
    #[inline]
    pub fn enter_critical(&self) {
        self.critical.enter(&self.port);
    }

    /// Leave one level of the critical section; interrupts are unmasked when
    /// the outermost level is left. Unbalanced exits are ignored.
    #[inline]
    pub fn exit_critical(&self) {
        self.critical.exit(&self.port);
    }

    /// Drop every nesting level and unmask interrupts unconditionally.
    /// Used on thread exit and error recovery.
    pub fn reset_critical(&self) {
        self.critical.reset(&self.port);
    }

    /// True while the calling core is inside a critical section.
    #[inline]
    pub fn is_critical(&self) -> bool {
        self.critical.is_active(&self.port)
    }

    /// Execute a closure within a critical section.
    ///
    /// # Usage
    /// ```ignore
    /// kernel.critical(|| {
    ///     // touch state shared with this core's interrupt handlers
    /// });
    /// ```
    #[inline]
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_critical();
        let result = f();
        self.exit_critical();
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::Kernel;
    use crate::port::mock::{on_core, MockPort};
    use crate::port::CoreId;

    #[test]
    fn test_nesting_masks_until_outermost_exit() {
        let kernel = Kernel::new(MockPort::new());
        on_core(CoreId::Cm7);

        kernel.enter_critical();
        kernel.enter_critical();
        assert!(kernel.is_critical());
        assert!(kernel.port().irq_masked(CoreId::Cm7));

        kernel.exit_critical();
        assert!(kernel.is_critical());
        assert!(kernel.port().irq_masked(CoreId::Cm7));

        kernel.exit_critical();
        assert!(!kernel.is_critical());
        assert!(!kernel.port().irq_masked(CoreId::Cm7));
    }

    #[test]
    fn test_unbalanced_exit_is_ignored() {
        let kernel = Kernel::new(MockPort::new());
        on_core(CoreId::Cm7);

        kernel.exit_critical();
        assert!(!kernel.is_critical());
        kernel.enter_critical();
        assert!(kernel.is_critical());
        kernel.exit_critical();
        assert!(!kernel.is_critical());
    }

    #[test]
    fn test_reset_clears_all_levels() {
        let kernel = Kernel::new(MockPort::new());
        on_core(CoreId::Cm4);

        for _ in 0..5 {
            kernel.enter_critical();
        }
        kernel.reset_critical();
        assert!(!kernel.is_critical());
        assert!(!kernel.port().irq_masked(CoreId::Cm4));
    }

    #[test]
    fn test_counters_are_per_core() {
        let kernel = Kernel::new(MockPort::new());
        on_core(CoreId::Cm7);
        kernel.enter_critical();

        on_core(CoreId::Cm4);
        assert!(!kernel.is_critical());
        assert!(!kernel.port().irq_masked(CoreId::Cm4));

        on_core(CoreId::Cm7);
        assert!(kernel.is_critical());
        kernel.exit_critical();
    }

    #[test]
    fn test_closure_form_is_balanced() {
        let kernel = Kernel::new(MockPort::new());
        on_core(CoreId::Cm7);

        let inside = kernel.critical(|| kernel.is_critical());
        assert!(inside);
        assert!(!kernel.is_critical());
    }
}
