//! # Port Interface
//!
//! The narrow set of services the kernel consumes from the hardware:
//! a monotonic clock, core identification, interrupt-context detection,
//! core-local interrupt masking, and a way to pend the context-switch
//! exception. Atomics come from `core::sync::atomic`.
//!
//! The Cortex-M implementation lives in [`crate::arch::cortex_m`]; host unit
//! tests use `mock::MockPort`, which models each core as an OS thread.

/// One of the two execution cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreId {
    /// The Cortex-M7 core (boot core).
    Cm7,
    /// The Cortex-M4 core.
    Cm4,
}

impl CoreId {
    /// Dense index for per-core arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            CoreId::Cm7 => 0,
            CoreId::Cm4 => 1,
        }
    }

    /// The core this one shares memory with.
    #[inline]
    pub const fn other(self) -> CoreId {
        match self {
            CoreId::Cm7 => CoreId::Cm4,
            CoreId::Cm4 => CoreId::Cm7,
        }
    }
}

/// Hardware services required by the kernel.
///
/// Every method is called from the core it concerns; implementations are
/// core-local except for [`Port::now`] and [`Port::signal_peer`].
pub trait Port: Sync {
    /// Monotonic time in microseconds.
    fn now(&self) -> u64;

    /// Core executing the caller.
    fn current_core(&self) -> CoreId;

    /// True while executing an exception/interrupt handler.
    fn in_interrupt(&self) -> bool;

    /// Mask interrupts on the calling core.
    fn disable_interrupts(&self);

    /// Unmask interrupts on the calling core.
    fn enable_interrupts(&self);

    /// Pend the lowest-priority context-switch exception on the calling core.
    fn request_context_switch(&self);

    /// Wake the other core so it services exclusive-section requests.
    fn signal_peer(&self) {}

    /// Idle the calling core until the next interrupt.
    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }

    /// Address a thread returns to when its entry function returns.
    fn thread_exit_address(&self) -> usize;

    /// Entry address of the synthetic idle context.
    fn idle_entry_address(&self) -> usize;

    /// Stop the calling core for good. Interrupts are already masked.
    fn halt(&self) -> !;
}
