//! # Critlocks
//!
//! A spinlock whose acquisition also enters a critical section on the
//! calling core. Holding a critlock therefore excludes both contenders on
//! the other core (through the lock word) and this core's interrupt handlers
//! (through the masked interrupts). Meant for small invariants touched from
//! thread and interrupt context alike; safe to use from interrupt handlers.
//!
//! Acquisition and critical-section entry are coupled: a successful
//! [`Kernel::acquire_critlock`] returns with the critical section still
//! entered, and [`Kernel::release_critlock`] leaves it.

use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::{KernelError, Result};
use crate::handle::{id_matches, IdGenerator, INVALID_ID};
use crate::kernel::Kernel;
use crate::port::Port;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

static CRITLOCK_IDS: IdGenerator = IdGenerator::new();

/// Caller-supplied backing memory for one critlock.
#[derive(Debug)]
pub struct CritlockMem {
    id: AtomicI32,
    lock: AtomicU32,
}

impl CritlockMem {
    /// Backing memory holding no critlock.
    pub const fn new() -> Self {
        Self {
            id: AtomicI32::new(INVALID_ID),
            lock: AtomicU32::new(UNLOCKED),
        }
    }

    /// Pre-initialized memory for a kernel-internal lock with a fixed id.
    pub(crate) const fn reserved(id: i32) -> Self {
        Self {
            id: AtomicI32::new(id),
            lock: AtomicU32::new(UNLOCKED),
        }
    }
}

impl Default for CritlockMem {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a critlock living in a [`CritlockMem`].
#[derive(Debug, Clone, Copy)]
pub struct Critlock<'a> {
    id: i32,
    mem: &'a CritlockMem,
}

impl<'a> Critlock<'a> {
    pub(crate) const fn from_parts(id: i32, mem: &'a CritlockMem) -> Self {
        Self { id, mem }
    }

    /// Identifier assigned at creation.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// True until the critlock is destroyed.
    pub fn is_valid(&self) -> bool {
        id_matches(self.id, &self.mem.id)
    }

    /// Whether the lock word is currently held.
    pub fn is_locked(&self) -> Result<bool> {
        if !self.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self.mem.lock.load(Ordering::Acquire) != UNLOCKED)
    }
}

impl PartialEq for Critlock<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && ptr::eq(self.mem, other.mem)
    }
}

impl Eq for Critlock<'_> {}

impl<P: Port> Kernel<P> {
    /// Create a critlock in `mem`. Any critlock previously living there is
    /// invalidated.
    pub fn create_critlock<'a>(&self, mem: &'a CritlockMem) -> Critlock<'a> {
        let id = CRITLOCK_IDS.next();
        mem.lock.store(UNLOCKED, Ordering::Relaxed);
        mem.id.store(id, Ordering::Release);
        log::debug!("critlock {} created", id);
        Critlock { id, mem }
    }

    /// Destroy an unlocked critlock.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `InvalidState` while locked.
    pub fn destroy_critlock(&self, lock: Critlock<'_>) -> Result<()> {
        if !lock.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        if lock.mem.lock.load(Ordering::Acquire) != UNLOCKED {
            return Err(KernelError::InvalidState);
        }
        lock.mem.id.store(INVALID_ID, Ordering::Release);
        log::debug!("critlock {} destroyed", lock.id);
        Ok(())
    }

    /// Acquire `lock`, spinning and yielding for up to `timeout_us`.
    ///
    /// At least one attempt is made whatever the timeout. Returns `Ok(true)`
    /// with this core's critical section entered, or `Ok(false)` if the
    /// timeout elapsed. Re-acquiring a critlock already held by the caller
    /// never succeeds; it simply times out.
    pub fn acquire_critlock(&self, lock: Critlock<'_>, timeout_us: u64) -> Result<bool> {
        if !lock.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let start = self.port.now();
        loop {
            self.enter_critical();
            if lock
                .mem
                .lock
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(true);
            }
            self.exit_critical();
            self.yield_now();
            if self.port.now().wrapping_sub(start) >= timeout_us {
                return Ok(false);
            }
            core::hint::spin_loop();
        }
    }

    /// Release `lock` and leave one level of the critical section.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `InvalidState` if not locked.
    pub fn release_critlock(&self, lock: Critlock<'_>) -> Result<()> {
        if !lock.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        if lock.mem.lock.load(Ordering::Acquire) == UNLOCKED {
            return Err(KernelError::InvalidState);
        }
        lock.mem.lock.store(UNLOCKED, Ordering::Release);
        self.exit_critical();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{in_irq, on_core, MockPort};
    use crate::port::CoreId;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release_couples_critical_section() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let lock = kernel.create_critlock(&mem);

        assert_eq!(kernel.acquire_critlock(lock, 0), Ok(true));
        assert!(kernel.is_critical());
        assert_eq!(lock.is_locked(), Ok(true));

        assert_eq!(kernel.release_critlock(lock), Ok(()));
        assert!(!kernel.is_critical());
        assert_eq!(lock.is_locked(), Ok(false));
    }

    #[test]
    fn test_second_acquire_by_holder_times_out() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let lock = kernel.create_critlock(&mem);

        assert_eq!(kernel.acquire_critlock(lock, 0), Ok(true));
        assert_eq!(kernel.acquire_critlock(lock, 2_000), Ok(false));
        // The failed attempt must not leave an extra critical level behind.
        assert_eq!(kernel.release_critlock(lock), Ok(()));
        assert!(!kernel.is_critical());
    }

    #[test]
    fn test_zero_timeout_makes_exactly_one_attempt() {
        let kernel = Arc::new(Kernel::new(MockPort::new()));
        let mem: &'static CritlockMem = Box::leak(Box::new(CritlockMem::new()));
        let lock = kernel.create_critlock(mem);
        assert_eq!(kernel.acquire_critlock(lock, 0), Ok(true));

        let contender = {
            let kernel = Arc::clone(&kernel);
            std::thread::spawn(move || {
                on_core(CoreId::Cm4);
                let zero = kernel.acquire_critlock(lock, 0);
                let attempts_at_zero = kernel.port().switch_requests(CoreId::Cm4);
                let critical = kernel.is_critical();

                let started = std::time::Instant::now();
                let longer = kernel.acquire_critlock(lock, 2_000);
                let waited = started.elapsed();
                let attempts_total = kernel.port().switch_requests(CoreId::Cm4);
                (zero, attempts_at_zero, critical, longer, waited, attempts_total)
            })
        };
        let (zero, attempts_at_zero, critical, longer, waited, attempts_total) =
            contender.join().unwrap();
        assert_eq!(zero, Ok(false));
        // Each failed attempt yields once.
        assert_eq!(attempts_at_zero, 1);
        assert!(!critical);

        assert_eq!(longer, Ok(false));
        assert!(waited >= std::time::Duration::from_micros(2_000));
        assert!(attempts_total > attempts_at_zero);

        kernel.release_critlock(lock).unwrap();
    }

    #[test]
    fn test_release_unlocked_is_invalid_state() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let lock = kernel.create_critlock(&mem);
        assert_eq!(kernel.release_critlock(lock), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_destroy_rules() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let lock = kernel.create_critlock(&mem);

        assert_eq!(kernel.acquire_critlock(lock, 0), Ok(true));
        assert_eq!(kernel.destroy_critlock(lock), Err(KernelError::InvalidState));
        kernel.release_critlock(lock).unwrap();

        assert_eq!(kernel.destroy_critlock(lock), Ok(()));
        assert!(!lock.is_valid());
        assert_eq!(kernel.destroy_critlock(lock), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.acquire_critlock(lock, 0), Err(KernelError::InvalidArgument));
        assert_eq!(lock.is_locked(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_reused_memory_invalidates_old_handle() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let old = kernel.create_critlock(&mem);
        kernel.destroy_critlock(old).unwrap();

        let new = kernel.create_critlock(&mem);
        assert!(new.is_valid());
        assert!(!old.is_valid());
        assert_ne!(old, new);
        let copy = new;
        assert_eq!(new, copy);
    }

    #[test]
    fn test_equality_needs_same_memory() {
        let mem_a = CritlockMem::new();
        let mem_b = CritlockMem::new();
        let a = Critlock::from_parts(5, &mem_a);
        let b = Critlock::from_parts(5, &mem_b);
        assert_ne!(a, b);
        assert_eq!(a, Critlock::from_parts(5, &mem_a));
    }

    #[test]
    fn test_usable_from_interrupt_context() {
        let kernel = Kernel::new(MockPort::new());
        let mem = CritlockMem::new();
        let lock = kernel.create_critlock(&mem);
        in_irq(|| {
            assert_eq!(kernel.acquire_critlock(lock, 0), Ok(true));
            assert_eq!(kernel.release_critlock(lock), Ok(()));
        });
    }

    #[test]
    fn test_cross_core_contention_is_exclusive() {
        let kernel = Arc::new(Kernel::new(MockPort::new()));
        let mem: &'static CritlockMem = Box::leak(Box::new(CritlockMem::new()));
        let lock = kernel.create_critlock(mem);
        let counter = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = [CoreId::Cm7, CoreId::Cm4]
            .into_iter()
            .map(|core| {
                let kernel = Arc::clone(&kernel);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    on_core(core);
                    let mut done = 0;
                    while done < 1_000 {
                        if kernel.acquire_critlock(lock, 10_000).unwrap() {
                            // Non-atomic read-modify-write, only correct under the lock.
                            let v = counter.load(Ordering::Relaxed);
                            counter.store(v + 1, Ordering::Relaxed);
                            kernel.release_critlock(lock).unwrap();
                            done += 1;
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2_000);
    }
}
