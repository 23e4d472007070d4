//! # Twincore Demo Firmware
//!
//! Exercises each primitive with a handful of threads. Each core boots this
//! `main` from its own vector table and stack. The Cortex-M7 creates the
//! shared critlock and mutex and the threads that use them; the Cortex-M4
//! adds one more supervisor on a stack of its own.
//!
//! | Thread | Created by | Priority | Uses |
//! |--------|------------|----------|------|
//! | `sampler` | M7 | 4 | critlock around a shared sample |
//! | `reporter` | M7 | 2 | recursive mutex, nested acquisition |
//! | `supervisor` | M7 and M4 | 1 | exclusive section around a shared counter, then exits |
//!
//! Threads are not pinned: either core may run any of them. The handles
//! the threads share are created in the M7's `main` and handed over by
//! address; `main` never returns, so its frame outlives every thread.
//! Failed operations are counted in `FAULTS` rather than dropped.

#![no_std]
#![no_main]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use twincore::arch::cortex_m::{self as arch, KERNEL};
use twincore::{CoreId, Critlock, CritlockMem, Mutex, MutexKind, MutexMem};

const STACK_WORDS: usize = 256;

static mut SAMPLER_STACK: [usize; STACK_WORDS] = [0; STACK_WORDS];
static mut REPORTER_STACK: [usize; STACK_WORDS] = [0; STACK_WORDS];
static mut SUPERVISOR_STACK: [usize; STACK_WORDS] = [0; STACK_WORDS];
static mut CM4_SUPERVISOR_STACK: [usize; STACK_WORDS] = [0; STACK_WORDS];

static SAMPLE_LOCK: CritlockMem = CritlockMem::new();
static REPORT_MUTEX: MutexMem = MutexMem::new();

static SAMPLE: AtomicU32 = AtomicU32::new(0);
static REPORTS: AtomicU32 = AtomicU32::new(0);
/// Touched by both cores, only inside exclusive sections.
static CROSS_CORE_ROUNDS: AtomicU32 = AtomicU32::new(0);
static FAULTS: AtomicU32 = AtomicU32::new(0);

struct Shared {
    sample_lock: Critlock<'static>,
    report_mutex: Mutex<'static>,
}

fn shared(arg: usize) -> &'static Shared {
    // SAFETY: `arg` is the address of `Shared` in main's frame, which never
    // returns.
    unsafe { &*(arg as *const Shared) }
}

/// Count a failed kernel call.
fn check<T>(result: twincore::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(_) => {
            FAULTS.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

/// Publishes a new sample every pass under the critlock.
extern "C" fn sampler(arg: usize) {
    let shared = shared(arg);
    loop {
        if let Some(true) = check(KERNEL.acquire_critlock(shared.sample_lock, 100)) {
            let next = SAMPLE.load(Ordering::Relaxed).wrapping_add(1);
            SAMPLE.store(next, Ordering::Relaxed);
            check(KERNEL.release_critlock(shared.sample_lock));
        }
        KERNEL.yield_now();
    }
}

/// Takes the recursive mutex twice per report.
extern "C" fn reporter(arg: usize) {
    let shared = shared(arg);
    loop {
        if let Some(true) = check(KERNEL.acquire_mutex(shared.report_mutex, 10_000)) {
            if let Some(true) = check(KERNEL.acquire_mutex(shared.report_mutex, 0)) {
                REPORTS.fetch_add(1, Ordering::Relaxed);
                check(KERNEL.release_mutex(shared.report_mutex));
            }
            check(KERNEL.release_mutex(shared.report_mutex));
        }
        KERNEL.sleep();
    }
}

/// Runs a fixed number of cross-core rounds, then returns (and so exits).
extern "C" fn supervisor(_arg: usize) {
    for _ in 0..1_000 {
        check(KERNEL.exclusive(|| {
            let rounds = CROSS_CORE_ROUNDS.load(Ordering::Relaxed);
            CROSS_CORE_ROUNDS.store(rounds + 1, Ordering::Relaxed);
        }));
        KERNEL.delay(10_000);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();

    match KERNEL.port().current_core() {
        CoreId::Cm7 => cm7_main(&mut cp),
        CoreId::Cm4 => cm4_main(&mut cp),
    }
}

fn cm7_main(cp: &mut cortex_m::Peripherals) -> ! {
    let shared = Shared {
        sample_lock: KERNEL.create_critlock(&SAMPLE_LOCK),
        report_mutex: KERNEL.create_mutex(&REPORT_MUTEX, MutexKind::Recursive),
    };
    let arg = &shared as *const Shared as usize;

    // SAFETY: these stacks are handed out exactly once, by this core only.
    let (sampler_stack, reporter_stack, supervisor_stack) = unsafe {
        (
            &mut *addr_of_mut!(SAMPLER_STACK),
            &mut *addr_of_mut!(REPORTER_STACK),
            &mut *addr_of_mut!(SUPERVISOR_STACK),
        )
    };

    KERNEL
        .create_thread(sampler_stack, sampler, arg, 4)
        .expect("failed to create sampler");
    KERNEL
        .create_thread(reporter_stack, reporter, arg, 2)
        .expect("failed to create reporter");
    KERNEL
        .create_thread(supervisor_stack, supervisor, 0, 1)
        .expect("failed to create supervisor");

    arch::start(&mut cp.SYST, &mut cp.SCB)
}

fn cm4_main(cp: &mut cortex_m::Peripherals) -> ! {
    // SAFETY: handed out exactly once, by this core only.
    let stack = unsafe { &mut *addr_of_mut!(CM4_SUPERVISOR_STACK) };
    KERNEL
        .create_thread(stack, supervisor, 0, 1)
        .expect("failed to create supervisor");

    arch::start(&mut cp.SYST, &mut cp.SCB)
}
