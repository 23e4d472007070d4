//! # Mutexes
//!
//! Blocking ownership locks owned by a thread. A mutex is either
//! [`MutexKind::Normal`] (one level, self re-entry is an error) or
//! [`MutexKind::Recursive`] (the owner may nest acquisitions and must release
//! once per acquisition).
//!
//! Waiting is spin-and-yield: between attempts the caller gives up the core
//! to the scheduler, so the owner gets to run and release. There is no wait
//! queue and no fairness among waiters; whoever wins the next attempt owns
//! the mutex.
//!
//! Owner and depth live behind a small internal spinlock taken inside a
//! critical section, so edits are atomic with respect to both cores.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::error::{KernelError, Result};
use crate::handle::{id_matches, IdGenerator, INVALID_ID};
use crate::kernel::Kernel;
use crate::port::Port;
use crate::thread::Thread;

static MUTEX_IDS: IdGenerator = IdGenerator::new();

/// Locking discipline of a mutex, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutexKind {
    /// Single level. The owner acquiring again is rejected.
    Normal = 0,
    /// Nested acquisitions by the owner; one release per acquisition.
    Recursive = 1,
}

impl MutexKind {
    fn from_raw(raw: u8) -> Self {
        if raw == MutexKind::Recursive as u8 {
            MutexKind::Recursive
        } else {
            MutexKind::Normal
        }
    }
}

#[derive(Debug)]
struct MutexState {
    owner: Option<Thread>,
    depth: u32,
}

/// Caller-supplied backing memory for one mutex.
#[derive(Debug)]
pub struct MutexMem {
    id: AtomicI32,
    kind: AtomicU8,
    guard: AtomicBool,
    state: UnsafeCell<MutexState>,
}

// SAFETY: `state` is only accessed through `StateGuard`, which holds `guard`.
unsafe impl Sync for MutexMem {}

impl MutexMem {
    /// Backing memory holding no mutex.
    pub const fn new() -> Self {
        Self {
            id: AtomicI32::new(INVALID_ID),
            kind: AtomicU8::new(MutexKind::Normal as u8),
            guard: AtomicBool::new(false),
            state: UnsafeCell::new(MutexState {
                owner: None,
                depth: 0,
            }),
        }
    }
}

impl Default for MutexMem {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a mutex living in a [`MutexMem`].
#[derive(Debug, Clone, Copy)]
pub struct Mutex<'a> {
    id: i32,
    mem: &'a MutexMem,
}

impl Mutex<'_> {
    /// Identifier assigned at creation.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// True until the mutex is destroyed.
    pub fn is_valid(&self) -> bool {
        id_matches(self.id, &self.mem.id)
    }

    /// Kind chosen at creation. Immutable, so no lock is taken.
    pub fn kind(&self) -> Result<MutexKind> {
        if !self.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(MutexKind::from_raw(self.mem.kind.load(Ordering::Relaxed)))
    }
}

impl PartialEq for Mutex<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && ptr::eq(self.mem, other.mem)
    }
}

impl Eq for Mutex<'_> {}

/// Exclusive access to a mutex's owner and depth. Holds the internal
/// spinlock and one level of the critical section until dropped.
struct StateGuard<'g, P: Port> {
    mem: &'g MutexMem,
    kernel: &'g Kernel<P>,
}

impl<P: Port> Deref for StateGuard<'_, P> {
    type Target = MutexState;

    fn deref(&self) -> &MutexState {
        // SAFETY: the guard flag is held for the lifetime of `self`.
        unsafe { &*self.mem.state.get() }
    }
}

impl<P: Port> DerefMut for StateGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut MutexState {
        // SAFETY: the guard flag is held for the lifetime of `self`.
        unsafe { &mut *self.mem.state.get() }
    }
}

impl<P: Port> Drop for StateGuard<'_, P> {
    fn drop(&mut self) {
        self.mem.guard.store(false, Ordering::Release);
        self.kernel.exit_critical();
    }
}

impl<P: Port> Kernel<P> {
    fn lock_state<'g>(&'g self, mem: &'g MutexMem) -> StateGuard<'g, P> {
        self.enter_critical();
        while mem
            .guard
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        StateGuard { mem, kernel: self }
    }

    /// Create an unlocked mutex of the given kind in `mem`. Any mutex
    /// previously living there is invalidated.
    pub fn create_mutex<'a>(&self, mem: &'a MutexMem, kind: MutexKind) -> Mutex<'a> {
        let id = MUTEX_IDS.next();
        {
            let mut state = self.lock_state(mem);
            state.owner = None;
            state.depth = 0;
            mem.kind.store(kind as u8, Ordering::Relaxed);
            mem.id.store(id, Ordering::Release);
        }
        log::debug!("mutex {} created ({:?})", id, kind);
        Mutex { id, mem }
    }

    /// Destroy an unlocked mutex.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `InvalidState` while locked.
    pub fn destroy_mutex(&self, mutex: Mutex<'_>) -> Result<()> {
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let state = self.lock_state(mutex.mem);
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        if state.depth != 0 {
            return Err(KernelError::InvalidState);
        }
        mutex.mem.id.store(INVALID_ID, Ordering::Release);
        drop(state);
        log::debug!("mutex {} destroyed", mutex.id);
        Ok(())
    }

    /// Acquire `mutex` for the calling thread, waiting up to `timeout_us`.
    ///
    /// Returns `Ok(true)` once owned and `Ok(false)` if the timeout elapsed.
    /// At least one attempt is made whatever the timeout. A recursive mutex
    /// already owned by the caller is re-entered immediately.
    ///
    /// # Errors
    /// - `InvalidOperation` from interrupt context or with no current thread
    /// - `InvalidArgument` for a stale handle (also if destroyed while waiting)
    /// - `InvalidState` when the owner re-acquires a normal mutex
    pub fn acquire_mutex(&self, mutex: Mutex<'_>, timeout_us: u64) -> Result<bool> {
        if self.port.in_interrupt() {
            return Err(KernelError::InvalidOperation);
        }
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let me = self.current_thread()?;
        let kind = mutex.kind()?;
        let start = self.port.now();
        loop {
            {
                let mut state = self.lock_state(mutex.mem);
                if !mutex.is_valid() {
                    return Err(KernelError::InvalidArgument);
                }
                if state.owner == Some(me) {
                    return match kind {
                        MutexKind::Recursive => {
                            state.depth = state
                                .depth
                                .checked_add(1)
                                .ok_or(KernelError::InvalidState)?;
                            Ok(true)
                        }
                        MutexKind::Normal => Err(KernelError::InvalidState),
                    };
                }
                if state.depth == 0 {
                    state.owner = Some(me);
                    state.depth = 1;
                    return Ok(true);
                }
            }
            self.yield_now();
            if self.port.now().wrapping_sub(start) >= timeout_us {
                return Ok(false);
            }
            core::hint::spin_loop();
        }
    }

    /// Release one level of `mutex` held by the calling thread.
    ///
    /// # Errors
    /// `InvalidOperation` from interrupt context, `InvalidArgument` for a
    /// stale handle, `InvalidState` if the caller is not the owner.
    pub fn release_mutex(&self, mutex: Mutex<'_>) -> Result<()> {
        if self.port.in_interrupt() {
            return Err(KernelError::InvalidOperation);
        }
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let me = self.current_thread()?;
        let kind = mutex.kind()?;
        let mut state = self.lock_state(mutex.mem);
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        if state.owner != Some(me) {
            return Err(KernelError::InvalidState);
        }
        match kind {
            MutexKind::Recursive => {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    state.owner = None;
                }
            }
            MutexKind::Normal => {
                state.owner = None;
                state.depth = 0;
            }
        }
        Ok(())
    }

    /// Whether `mutex` is currently held by any thread.
    pub fn is_mutex_locked(&self, mutex: Mutex<'_>) -> Result<bool> {
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let state = self.lock_state(mutex.mem);
        Ok(state.depth > 0)
    }

    /// Thread currently owning `mutex`, if any.
    pub fn mutex_owner(&self, mutex: Mutex<'_>) -> Result<Option<Thread>> {
        if !mutex.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let state = self.lock_state(mutex.mem);
        Ok(state.owner)
    }
}
