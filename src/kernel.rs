//! # Kernel
//!
//! The [`Kernel`] object holding all scheduling and synchronization state
//! shared by both cores, and the thread API built on it.
//!
//! One kernel value serves both cores. It is `const`-constructible so the
//! target build keeps it in a `static` placed in memory both cores can see;
//! every per-core piece of state is an array indexed by [`CoreId`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt, each core)
//!   └─► main()
//!         ├─► KERNEL.create_thread() ← threads for this core (×N)
//!         └─► arch::cortex_m::start() ← SysTick + priorities, no return
//!               └─► PendSV ─► Kernel::switch_context() ─► first thread
//! ```
//!
//! ## Locking
//!
//! The thread table is guarded by a kernel-internal critlock, so table
//! edits are atomic against the other core and this core's interrupts.
//! Which thread is running on each core is kept in per-core atomics so it
//! can be read without that lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::arch::cortex_m::init_stack_frame;
use crate::config::{
    CORE_COUNT, IDLE_STACK_WORDS, MAX_THREADS, MAX_THREAD_PRIORITY, MIN_STACK_WORDS,
    THREAD_TABLE_TIMEOUT_US,
};
use crate::critlock::{Critlock, CritlockMem};
use crate::error::{KernelError, Result};
use crate::exclusive::ExclusiveState;
use crate::handle::{id_matches, IdGenerator, INVALID_ID};
use crate::port::{CoreId, Port};
use crate::scheduler::ThreadTable;
use crate::shutdown::ShutdownFlags;
use crate::sync::CriticalNesting;
use crate::thread::{Thread, ThreadControlBlock, ThreadState};

/// `running` value of a core executing its idle context.
const NO_THREAD: usize = usize::MAX;

/// Fixed identifier of the thread-table lock; its memory is private.
const TABLE_LOCK_ID: i32 = 0;

// ---------------------------------------------------------------------------
// Kernel object
// ---------------------------------------------------------------------------

/// Scheduling and synchronization state for both cores.
pub struct Kernel<P> {
    pub(crate) port: P,
    pub(crate) critical: CriticalNesting,
    pub(crate) exclusive: ExclusiveState,
    pub(crate) shutdown_flags: ShutdownFlags,
    table_lock: CritlockMem,
    table: UnsafeCell<ThreadTable>,
    /// Identifier of the thread in each slot, `INVALID_ID` when free.
    thread_ids: [AtomicI32; MAX_THREADS],
    /// Stack size in bytes of the thread in each slot. Written before the
    /// slot's id is published, so readers need no table lock.
    stack_sizes: [AtomicUsize; MAX_THREADS],
    /// Slot running on each core, or `NO_THREAD`.
    running: [AtomicUsize; CORE_COUNT],
    idle_stacks: [UnsafeCell<[usize; IDLE_STACK_WORDS]>; CORE_COUNT],
    thread_id_gen: IdGenerator,
}

// SAFETY: `table` is only accessed with `table_lock` held, and each idle
// stack only by its own core's context switch. Everything else is atomic.
unsafe impl<P: Port> Sync for Kernel<P> {}

impl<P: Port> Kernel<P> {
    /// Create a kernel with an empty thread table.
    pub const fn new(port: P) -> Self {
        Self {
            port,
            critical: CriticalNesting::new(),
            exclusive: ExclusiveState::new(),
            shutdown_flags: ShutdownFlags::new(),
            table_lock: CritlockMem::reserved(TABLE_LOCK_ID),
            table: UnsafeCell::new(ThreadTable::new()),
            thread_ids: [const { AtomicI32::new(INVALID_ID) }; MAX_THREADS],
            stack_sizes: [const { AtomicUsize::new(0) }; MAX_THREADS],
            running: [const { AtomicUsize::new(NO_THREAD) }; CORE_COUNT],
            idle_stacks: [const { UnsafeCell::new([0; IDLE_STACK_WORDS]) }; CORE_COUNT],
            thread_id_gen: IdGenerator::new(),
        }
    }

    /// The hardware port this kernel runs on.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run `f` on the thread table with the table lock held.
    fn with_table<R>(&self, f: impl FnOnce(&mut ThreadTable) -> Result<R>) -> Result<R> {
        let lock = Critlock::from_parts(TABLE_LOCK_ID, &self.table_lock);
        match self.acquire_critlock(lock, THREAD_TABLE_TIMEOUT_US) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("thread table lock timed out");
                return Err(KernelError::Timeout);
            }
            Err(_) => return Err(KernelError::Internal),
        }
        // SAFETY: the table lock is held until released below.
        let result = f(unsafe { &mut *self.table.get() });
        self.release_critlock(lock)
            .map_err(|_| KernelError::Internal)?;
        result
    }

    /// Control block of a live `thread`, or `InvalidArgument` if the handle
    /// is stale.
    fn lookup<'t>(
        &self,
        table: &'t mut ThreadTable,
        thread: Thread,
    ) -> Result<&'t mut ThreadControlBlock> {
        if !self.is_valid_thread(thread) {
            return Err(KernelError::InvalidArgument);
        }
        table
            .get_mut(thread.slot)
            .ok_or(KernelError::InvalidArgument)
    }

    fn running_slot(&self, core: CoreId) -> Option<usize> {
        match self.running[core.index()].load(Ordering::Acquire) {
            NO_THREAD => None,
            slot => Some(slot),
        }
    }

    fn set_running(&self, core: CoreId, slot: Option<usize>) {
        self.running[core.index()].store(slot.unwrap_or(NO_THREAD), Ordering::Release);
    }

    fn is_current_anywhere(&self, slot: usize) -> bool {
        self.running
            .iter()
            .any(|r| r.load(Ordering::Acquire) == slot)
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Create a Ready thread that will run `entry(arg)` on whichever core
    /// schedules it first.
    ///
    /// The thread owns `stack` until it is destroyed. Its lowest word
    /// becomes the overflow guard. Returning from `entry` is the same as
    /// calling [`Kernel::exit`].
    ///
    /// # Errors
    /// - `InvalidArgument`: priority outside `1..=MAX_THREAD_PRIORITY`, or
    ///   fewer than `MIN_STACK_WORDS` words of stack
    /// - `NoMemory`: the thread table is full (the stack is not returned)
    pub fn create_thread(
        &self,
        stack: &'static mut [usize],
        entry: extern "C" fn(usize),
        arg: usize,
        priority: u32,
    ) -> Result<Thread> {
        if !(1..=MAX_THREAD_PRIORITY).contains(&priority) || stack.len() < MIN_STACK_WORDS {
            return Err(KernelError::InvalidArgument);
        }
        let tcb = ThreadControlBlock::new(
            stack,
            entry as usize,
            arg,
            self.port.thread_exit_address(),
            priority,
        )
        .ok_or(KernelError::InvalidArgument)?;

        let id = self.thread_id_gen.next();
        let stack_size = tcb.stack_size();
        let slot = self.with_table(|table| {
            let slot = table.insert(tcb).ok_or(KernelError::NoMemory)?;
            self.stack_sizes[slot].store(stack_size, Ordering::Relaxed);
            self.thread_ids[slot].store(id, Ordering::Release);
            Ok(slot)
        })?;
        log::debug!("thread {} created in slot {} (priority {})", id, slot, priority);
        Ok(Thread { id, slot })
    }

    /// Free a Stopped thread's slot and invalidate its handle.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle. `InvalidState` unless the
    /// thread is Stopped and no core is still executing on its stack.
    pub fn destroy_thread(&self, thread: Thread) -> Result<()> {
        self.with_table(|table| {
            let tcb = self.lookup(table, thread)?;
            if tcb.state != ThreadState::Stopped || self.is_current_anywhere(thread.slot) {
                return Err(KernelError::InvalidState);
            }
            self.thread_ids[thread.slot].store(INVALID_ID, Ordering::Release);
            table.remove(thread.slot);
            Ok(())
        })?;
        log::debug!("thread {} destroyed", thread.id);
        Ok(())
    }

    /// Suspend a Ready or Running thread.
    ///
    /// Suspending the thread running on this core switches away at once.
    /// A thread running on the other core keeps going until that core's
    /// next context switch.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `InvalidState` if the thread is
    /// not Ready or Running, or if it is the caller suspending itself from
    /// inside a critical or exclusive section.
    pub fn suspend_thread(&self, thread: Thread) -> Result<()> {
        let core = self.port.current_core();
        let is_self = self.running_slot(core) == Some(thread.slot);
        let protected = self.is_critical() || self.is_exclusive();
        if is_self && protected && !self.port.in_interrupt() {
            return Err(KernelError::InvalidState);
        }

        self.with_table(|table| {
            let tcb = self.lookup(table, thread)?;
            match tcb.state {
                ThreadState::Ready | ThreadState::Running => {
                    tcb.state = ThreadState::Suspended;
                    Ok(())
                }
                _ => Err(KernelError::InvalidState),
            }
        })?;
        log::debug!("thread {} suspended", thread.id);

        if is_self {
            self.port.request_context_switch();
        }
        Ok(())
    }

    /// Make a Suspended thread Ready again.
    ///
    /// A thread suspended while running that no core has switched away from
    /// yet goes straight back to Running on that core.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `InvalidState` unless Suspended.
    pub fn resume_thread(&self, thread: Thread) -> Result<()> {
        self.with_table(|table| {
            let tcb = self.lookup(table, thread)?;
            if tcb.state != ThreadState::Suspended {
                return Err(KernelError::InvalidState);
            }
            tcb.state = if self.is_current_anywhere(thread.slot) {
                ThreadState::Running
            } else {
                ThreadState::Ready
            };
            Ok(())
        })?;
        log::debug!("thread {} resumed", thread.id);
        Ok(())
    }

    /// Give up the core. Only pends a switch from thread context, outside
    /// critical and exclusive sections; otherwise does nothing.
    pub fn yield_now(&self) {
        if !self.port.in_interrupt() && !self.is_critical() && !self.is_exclusive() {
            self.port.request_context_switch();
        }
    }

    /// Mark the thread running on this core Stopped and pend a switch.
    pub(crate) fn stop_current(&self) -> Result<()> {
        if self.port.in_interrupt() {
            return Err(KernelError::InvalidOperation);
        }
        let slot = self
            .running_slot(self.port.current_core())
            .ok_or(KernelError::InvalidOperation)?;
        self.with_table(|table| {
            if let Some(tcb) = table.get_mut(slot) {
                tcb.state = ThreadState::Stopped;
            }
            Ok(())
        })?;
        self.port.request_context_switch();
        Ok(())
    }

    /// Terminate the calling thread. **Does not return.**
    ///
    /// Drops any critical or exclusive section the thread still holds, marks
    /// it Stopped and waits for the switch away. Called from an interrupt
    /// handler this is a contract violation: it is logged and the core parks.
    pub fn exit(&self) -> ! {
        if self.port.in_interrupt() {
            log::error!("exit called from interrupt context; parking core");
            loop {
                self.port.wait_for_interrupt();
            }
        }
        self.reset_critical();
        if let Err(err) = self.reset_exclusive() {
            log::warn!("exit: could not reset exclusive section: {}", err);
        }
        loop {
            match self.stop_current() {
                Err(KernelError::Timeout) => continue,
                Err(err) => log::error!("exit: {}", err),
                Ok(()) => {}
            }
            self.port.wait_for_interrupt();
        }
    }

    // -----------------------------------------------------------------------
    // Thread queries
    // -----------------------------------------------------------------------

    /// Thread running on the calling core.
    ///
    /// # Errors
    /// `InvalidOperation` from interrupt context or while the core idles.
    pub fn current_thread(&self) -> Result<Thread> {
        if self.port.in_interrupt() {
            return Err(KernelError::InvalidOperation);
        }
        let slot = self
            .running_slot(self.port.current_core())
            .ok_or(KernelError::InvalidOperation)?;
        Ok(Thread {
            id: self.thread_ids[slot].load(Ordering::Acquire),
            slot,
        })
    }

    /// True until `thread` is destroyed.
    pub fn is_valid_thread(&self, thread: Thread) -> bool {
        self.thread_ids
            .get(thread.slot)
            .is_some_and(|stored| id_matches(thread.id, stored))
    }

    /// Current state of `thread`.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `Timeout` if the thread table
    /// stays busy.
    pub fn thread_state(&self, thread: Thread) -> Result<ThreadState> {
        self.with_table(|table| Ok(self.lookup(table, thread)?.state))
    }

    /// Scheduling weight of `thread`, in `1..=MAX_THREAD_PRIORITY`.
    ///
    /// # Errors
    /// `InvalidArgument` for a stale handle, `Timeout` if the thread table
    /// stays busy.
    pub fn thread_priority(&self, thread: Thread) -> Result<u32> {
        self.with_table(|table| Ok(self.lookup(table, thread)?.priority))
    }

    /// Change a thread's scheduling weight. Takes effect from the next
    /// scheduling pass; accumulated credit is kept.
    pub fn set_thread_priority(&self, thread: Thread, priority: u32) -> Result<()> {
        if !(1..=MAX_THREAD_PRIORITY).contains(&priority) {
            return Err(KernelError::InvalidArgument);
        }
        self.with_table(|table| {
            self.lookup(table, thread)?.priority = priority;
            Ok(())
        })
    }

    /// Size of the thread's stack in bytes, guard word included.
    ///
    /// Fixed at creation, so read without the table lock. The handle is
    /// checked on both sides of the read in case the slot is reused
    /// meanwhile.
    pub fn thread_stack_size(&self, thread: Thread) -> Result<usize> {
        if !self.is_valid_thread(thread) {
            return Err(KernelError::InvalidArgument);
        }
        let size = self.stack_sizes[thread.slot].load(Ordering::Acquire);
        if !self.is_valid_thread(thread) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(size)
    }

    /// Bytes of stack in use as of the thread's last switch-out. Stale while
    /// the thread is running.
    pub fn thread_stack_usage(&self, thread: Thread) -> Result<usize> {
        self.with_table(|table| Ok(self.lookup(table, thread)?.stack_usage()))
    }

    /// Whether the thread has overwritten the guard word below its stack.
    pub fn is_stack_overflowed(&self, thread: Thread) -> Result<bool> {
        self.with_table(|table| Ok(!self.lookup(table, thread)?.guard_intact()))
    }

    // -----------------------------------------------------------------------
    // Context switch and periodic handlers
    // -----------------------------------------------------------------------

    /// Body of the context-switch exception.
    ///
    /// `saved_sp` is the outgoing context's stack pointer after its
    /// registers were pushed. Runs one scheduling pass for this core and
    /// returns the stack pointer to restore: the selected thread's, or a
    /// fresh idle context when nothing is Ready. If the table is busy past
    /// its timeout the outgoing context simply resumes.
    pub fn switch_context(&self, saved_sp: *mut usize) -> *mut usize {
        let core = self.port.current_core();
        let outgoing = self.running_slot(core);

        let next = self.with_table(|table| {
            if let Some(tcb) = outgoing.and_then(|slot| table.get_mut(slot)) {
                tcb.sp = saved_sp;
            }
            let next = table.schedule(outgoing, self.running_slot(core.other()));
            self.set_running(core, next);
            Ok(next.and_then(|slot| table.get(slot)).map(|tcb| tcb.sp))
        });

        match next {
            Ok(Some(sp)) => sp,
            Ok(None) => self.install_idle(core),
            Err(_) => saved_sp,
        }
    }

    /// Build a fresh idle frame on `core`'s idle stack.
    fn install_idle(&self, core: CoreId) -> *mut usize {
        // SAFETY: only `core`'s context switch touches its idle stack, and
        // any idle context it replaces has already been abandoned.
        let stack = unsafe { &mut *self.idle_stacks[core.index()].get() };
        let idle = self.port.idle_entry_address();
        let sp = init_stack_frame(stack, idle, 0, idle).unwrap_or_default();
        stack.as_mut_ptr().wrapping_add(sp)
    }

    /// Top of the calling core's idle stack. Used as the process stack
    /// before the first context switch.
    pub fn idle_stack_top(&self) -> *mut usize {
        let core = self.port.current_core().index();
        (self.idle_stacks[core].get() as *mut usize).wrapping_add(IDLE_STACK_WORDS)
    }

    /// Periodic tick, called from this core's timer interrupt.
    ///
    /// Joins a shutdown the other core asked for (and then does not
    /// return). Otherwise acknowledges a pending exclusive section of the
    /// other core, then pends a switch unless this core is in a critical or
    /// exclusive section.
    pub fn on_tick(&self) {
        self.service_shutdown();
        self.service_exclusive();
        if !self.is_critical() && !self.is_exclusive() {
            self.port.request_context_switch();
        }
    }

    /// Inter-core event, raised by the other core when it enters an
    /// exclusive section or shuts down.
    pub fn on_peer_signal(&self) {
        self.service_shutdown();
        self.service_exclusive();
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    /// Wait for the next interrupt, unless in a critical section (where it
    /// would never be taken).
    pub fn sleep(&self) {
        if !self.is_critical() {
            self.port.wait_for_interrupt();
        }
    }

    /// Busy-wait for `us` microseconds, yielding between checks.
    pub fn delay(&self, us: u64) {
        let start = self.port.now();
        while self.port.now().wrapping_sub(start) < us {
            self.yield_now();
            core::hint::spin_loop();
        }
    }
}

// ---------------------------------------------------------------------------
// Test helpers (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::port::mock::MockPort;

    pub(crate) extern "C" fn nop_entry(_arg: usize) {}

    pub(crate) fn stack(words: usize) -> &'static mut [usize] {
        Box::leak(vec![0usize; words].into_boxed_slice())
    }

    pub(crate) fn spawn(kernel: &Kernel<MockPort>, priority: u32) -> Thread {
        kernel
            .create_thread(stack(MIN_STACK_WORDS * 2), nop_entry, 0, priority)
            .unwrap()
    }

    /// Make `thread` the one running on the calling core, as if this core's
    /// scheduler had just picked it.
    pub(crate) fn switch_to(kernel: &Kernel<MockPort>, thread: Thread) {
        let core = kernel.port.current_core();
        kernel
            .with_table(|table| {
                if let Some(prev) = kernel.running_slot(core).and_then(|s| table.get_mut(s)) {
                    if prev.state == ThreadState::Running {
                        prev.state = ThreadState::Ready;
                    }
                }
                let tcb = table
                    .get_mut(thread.slot)
                    .ok_or(KernelError::InvalidArgument)?;
                tcb.state = ThreadState::Running;
                kernel.set_running(core, Some(thread.slot));
                Ok(())
            })
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
