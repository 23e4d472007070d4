//! # Twincore — Dual-Core Scheduling and Synchronization Kernel
//!
//! The concurrency core of an embedded kernel for a dual-core
//! microcontroller (Cortex-M7 + Cortex-M4, e.g. the STM32H745), where both
//! cores share memory but run independent instruction streams.
//!
//! ## Overview
//!
//! - **Per-core preemptive scheduling** of threads from one shared,
//!   fixed-capacity table, using a credit-based weighted algorithm
//! - **Critical sections**: per-core, nesting-counted interrupt masking
//! - **Critlocks**: short spinlocks coupled with a critical section
//! - **Mutexes**: normal and recursive ownership locks with timeouts
//! - **Exclusive sections**: mutual exclusion across both cores through a
//!   shared-memory request/acknowledge handshake
//! - **Coordinated shutdown**: both cores halt together
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │               Kernel API (kernel.rs)                    │
//! │   create_thread · suspend · resume · yield_now · exit   │
//! ├──────────────┬───────────────┬─────────────────────────┤
//! │  Scheduler   │  Mutex        │  Exclusive Section      │
//! │ scheduler.rs │  mutex.rs     │  exclusive.rs           │
//! │ ─ schedule() │  ─ acquire()  │  ─ enter() / exit()     │
//! │ ─ credits    │  ─ release()  │  ─ peer acknowledgment  │
//! ├──────────────┴───────┬───────┴─────────────────────────┤
//! │  Thread Model        │  Critlock · Critical Section    │
//! │  thread.rs           │  critlock.rs · sync.rs          │
//! ├──────────────────────┴─────────────────────────────────┤
//! │   Port (port.rs) · Arch (arch/cortex_m.rs)              │
//! │   PendSV · SysTick · Frame Init · CPUID · SEV           │
//! ├────────────────────────────────────────────────────────┤
//! │      Cortex-M7  ◄── shared AXI SRAM ──►  Cortex-M4      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handles
//!
//! Threads, mutexes and critlocks are named by small `Copy` handles pairing
//! an identifier with caller-supplied backing memory. Destroying a resource
//! invalidates every copy of its handle, even if the memory is reused.
//!
//! ## Memory Model
//!
//! - **No heap**: all state lives in the [`Kernel`] value or in backing
//!   blocks supplied by the caller
//! - **Fixed thread table**: [`config::MAX_THREADS`] slots
//! - **Caller-owned stacks**: `&'static mut [usize]`, guard word at the bottom
//! - **Host testable**: hardware access goes through the [`Port`] trait

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod critlock;
pub mod error;
pub mod exclusive;
pub mod handle;
pub mod kernel;
pub mod mutex;
pub mod port;
pub mod scheduler;
pub mod shutdown;
pub mod sync;
pub mod thread;

pub use critlock::{Critlock, CritlockMem};
pub use error::{KernelError, Result};
pub use kernel::Kernel;
pub use mutex::{Mutex, MutexKind, MutexMem};
pub use port::{CoreId, Port};
pub use thread::{Thread, ThreadState};
