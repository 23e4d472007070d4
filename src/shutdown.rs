//! # Coordinated Shutdown
//!
//! Stopping one core while the other keeps running would leave the
//! survivor spinning on exclusive-section handshakes nobody answers, so
//! both cores always go down together.
//!
//! ## Handshake
//!
//! ```text
//!   core X (shutdown)                core Y (tick / peer signal)
//!   ─────────────────                ───────────────────────────
//!   enter critical
//!   flag[X] = 1 ──── dsb; sev ────►  sees flag[X]
//!   spin until flag[Y] ◄──────────── flag[Y] = 1
//!   halt                             halt
//! ```
//!
//! Two cores requesting at the same time each see the other's flag and
//! both proceed.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::CORE_COUNT;
use crate::kernel::Kernel;
use crate::port::{CoreId, Port};

/// One shutdown flag per core. Set once, never cleared.
pub(crate) struct ShutdownFlags {
    flags: [AtomicBool; CORE_COUNT],
}

impl ShutdownFlags {
    pub(crate) const fn new() -> Self {
        Self {
            flags: [const { AtomicBool::new(false) }; CORE_COUNT],
        }
    }

    pub(crate) fn is_set(&self, core: CoreId) -> bool {
        self.flags[core.index()].load(Ordering::Acquire)
    }

    fn set(&self, core: CoreId) {
        self.flags[core.index()].store(true, Ordering::Release);
    }
}

impl<P: Port> Kernel<P> {
    /// Shut both cores down. **Does not return.**
    ///
    /// Drops any exclusive section this core holds, so a peer parked on it
    /// can notice the request. Then masks interrupts here and waits for the
    /// other core to agree before halting. There is no timeout: a core that
    /// never answers keeps this one parked with interrupts masked.
    pub fn shutdown(&self) -> ! {
        let this = self.port.current_core();
        if let Err(err) = self.reset_exclusive() {
            log::warn!("shutdown: could not reset exclusive section: {}", err);
        }
        self.enter_critical();
        self.shutdown_flags.set(this);
        log::debug!("{:?}: shutdown requested", this);
        self.port.signal_peer();
        while !self.shutdown_flags.is_set(this.other()) {
            core::hint::spin_loop();
        }
        self.port.halt()
    }

    /// True once `core` has asked for or agreed to a shutdown.
    pub fn is_shutting_down(&self, core: CoreId) -> bool {
        self.shutdown_flags.is_set(core)
    }

    /// Agree to and carry out a shutdown the other core asked for. Returns
    /// only when none is pending.
    pub(crate) fn service_shutdown(&self) {
        let this = self.port.current_core();
        if !self.shutdown_flags.is_set(this.other()) {
            return;
        }
        self.enter_critical();
        self.shutdown_flags.set(this);
        log::debug!("{:?}: joining shutdown", this);
        self.port.halt()
    }
}
