//! # Exclusive Sections
//!
//! Mutual exclusion across both cores. A critical section only silences one
//! core; an exclusive section additionally parks the other core for as long
//! as it is held, using nothing but shared memory:
//!
//! - each core has a count: `-1` acknowledging/waiting, `0` idle, `n > 0`
//!   held with nesting depth `n`
//! - one lock word serializes every read and write of both counts
//!
//! Entering is a two-phase handshake. The requesting core waits until the
//! other core's count is not positive, takes the section (count `>= 1`),
//! signals the peer, then waits for the peer to acknowledge by setting its
//! own count to `-1`. The peer acknowledges either from its own
//! [`Kernel::enter_exclusive`] (which waits while we hold) or from its tick
//! and peer-signal handlers, which call [`Kernel::service_exclusive`] and
//! spin there until the section is released.
//!
//! The counts are the only state in the kernel written by both cores. On a
//! timeout the protocol rolls both counts back to zero so the system cannot
//! stay deadlocked across cores.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::config::{
    CORE_COUNT, EXCLUSIVE_ACK_TIMEOUT_US, EXCLUSIVE_LOCK_TIMEOUT_US, EXCLUSIVE_SECTION_TIMEOUT_US,
};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::port::{CoreId, Port};

/// Count value of a core that is waiting on, or acknowledging, the other
/// core's section.
const WAITING: i32 = -1;

/// Shared handshake state. Every access to `counts` other than the
/// lock-free [`Kernel::is_exclusive`] read happens with `lock` held.
pub(crate) struct ExclusiveState {
    counts: [AtomicI32; CORE_COUNT],
    lock: AtomicU32,
}

impl ExclusiveState {
    pub(crate) const fn new() -> Self {
        Self {
            counts: [const { AtomicI32::new(0) }; CORE_COUNT],
            lock: AtomicU32::new(0),
        }
    }

    fn lock<P: Port>(&self, port: &P) -> bool {
        let start = port.now();
        while self
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if port.now().wrapping_sub(start) > EXCLUSIVE_LOCK_TIMEOUT_US {
                return false;
            }
            core::hint::spin_loop();
        }
        true
    }

    fn unlock(&self) {
        self.lock.store(0, Ordering::Release);
    }

    /// Drop the lock word and take it again, giving the other core a window
    /// to edit its count.
    fn relock<P: Port>(&self, port: &P) -> bool {
        self.unlock();
        self.lock(port)
    }

    pub(crate) fn count(&self, core: CoreId) -> i32 {
        self.counts[core.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, core: CoreId, value: i32) {
        self.counts[core.index()].store(value, Ordering::Relaxed);
    }

    /// Put `core`'s count back to `value` after the lock word was lost
    /// mid-handshake. The count is left alone if the lock cannot be retaken.
    fn restore<P: Port>(&self, port: &P, core: CoreId, value: i32) {
        if self.lock(port) {
            self.set(core, value);
            self.unlock();
        } else {
            log::warn!("{:?}: exclusive lock lost, count left at {}", core, self.count(core));
        }
    }

    fn roll_back(&self) {
        self.counts[0].store(0, Ordering::Relaxed);
        self.counts[1].store(0, Ordering::Relaxed);
    }
}

impl<P: Port> Kernel<P> {
    /// Enter (or nest) the exclusive section on the calling core.
    ///
    /// Returns once the other core has acknowledged and is parked.
    ///
    /// # Errors
    /// - `Timeout` if the other core held the section too long, or never
    ///   acknowledged; both counts are reset to zero
    /// - `Internal` if the shared lock word could not be taken
    pub fn enter_exclusive(&self) -> Result<()> {
        let state = &self.exclusive;
        let this = self.port.current_core();
        let other = this.other();

        self.enter_critical();
        if !state.lock(&self.port) {
            self.exit_critical();
            return Err(KernelError::Internal);
        }

        // Also serves as our acknowledgment when both cores race to enter.
        if state.count(other) > 0 {
            let previous = state.count(this);
            state.set(this, WAITING);
            let start = self.port.now();
            while state.count(other) > 0 {
                if self.port.now().wrapping_sub(start) > EXCLUSIVE_SECTION_TIMEOUT_US {
                    state.roll_back();
                    state.unlock();
                    self.exit_critical();
                    log::warn!("{:?}: peer held exclusive section past timeout, counts reset", this);
                    return Err(KernelError::Timeout);
                }
                if !state.relock(&self.port) {
                    state.restore(&self.port, this, previous);
                    self.exit_critical();
                    return Err(KernelError::Internal);
                }
            }
        }

        if state.count(this) == WAITING {
            state.set(this, 0);
        }
        let depth = state.count(this);
        state.set(this, depth + 1);
        self.port.signal_peer();

        let start = self.port.now();
        while state.count(other) != WAITING {
            if self.port.now().wrapping_sub(start) > EXCLUSIVE_ACK_TIMEOUT_US {
                state.roll_back();
                state.unlock();
                self.exit_critical();
                log::warn!("{:?}: peer never acknowledged exclusive section, counts reset", this);
                return Err(KernelError::Timeout);
            }
            if !state.relock(&self.port) {
                state.restore(&self.port, this, depth);
                self.exit_critical();
                return Err(KernelError::Internal);
            }
        }

        state.unlock();
        self.exit_critical();
        Ok(())
    }

    /// Leave one nesting level of the exclusive section.
    ///
    /// # Errors
    /// `Internal` if the section is not held or the lock word could not be
    /// taken.
    pub fn exit_exclusive(&self) -> Result<()> {
        let state = &self.exclusive;
        let this = self.port.current_core();

        self.enter_critical();
        if !state.lock(&self.port) {
            self.exit_critical();
            return Err(KernelError::Internal);
        }
        let count = state.count(this);
        if count <= 0 {
            state.unlock();
            self.exit_critical();
            return Err(KernelError::Internal);
        }
        state.set(this, count - 1);
        state.unlock();
        self.exit_critical();
        Ok(())
    }

    /// Force this core's count to zero. Error-recovery escape hatch.
    pub fn reset_exclusive(&self) -> Result<()> {
        let state = &self.exclusive;
        let this = self.port.current_core();

        self.enter_critical();
        if !state.lock(&self.port) {
            self.exit_critical();
            return Err(KernelError::Internal);
        }
        state.set(this, 0);
        state.unlock();
        self.exit_critical();
        Ok(())
    }

    /// True while the calling core holds the exclusive section.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.count(self.port.current_core()) > 0
    }

    /// Execute a closure within an exclusive section.
    ///
    /// The closure does not run if the section cannot be entered.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.enter_exclusive()?;
        let result = f();
        self.exit_exclusive()?;
        Ok(result)
    }

    /// Acknowledge the other core's exclusive section, if it holds one.
    ///
    /// Parks this core (interrupts masked) until the other core releases the
    /// section. Does nothing while this core holds the section itself.
    pub(crate) fn service_exclusive(&self) {
        let state = &self.exclusive;
        let this = self.port.current_core();
        let other = this.other();

        self.enter_critical();
        if !state.lock(&self.port) {
            self.exit_critical();
            return;
        }
        let previous = state.count(this);
        if state.count(other) > 0 && previous <= 0 {
            state.set(this, WAITING);
            let start = self.port.now();
            while state.count(other) > 0 {
                if self.port.now().wrapping_sub(start) > EXCLUSIVE_SECTION_TIMEOUT_US {
                    state.roll_back();
                    state.unlock();
                    self.exit_critical();
                    log::warn!("{:?}: peer held exclusive section past timeout, counts reset", this);
                    return;
                }
                if !state.relock(&self.port) {
                    state.restore(&self.port, this, previous);
                    self.exit_critical();
                    return;
                }
            }
            state.set(this, 0);
        }
        state.unlock();
        self.exit_critical();
    }
}
