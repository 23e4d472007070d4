//! # Twincore Configuration
//!
//! Compile-time constants governing the scheduler and synchronization
//! primitives. All limits are fixed at compile time; there is no dynamic
//! allocation and no runtime configuration.
//!
//! Every timeout in the crate is expressed in microseconds of the port's
//! monotonic clock.

use static_assertions::const_assert;

/// Number of execution cores sharing kernel state (Cortex-M7 + Cortex-M4).
pub const CORE_COUNT: usize = 2;

/// Capacity of the thread table. Threads beyond this are rejected with
/// `NoMemory`.
pub const MAX_THREADS: usize = 16;

/// Highest accepted thread priority. Valid priorities are `1..=MAX_THREAD_PRIORITY`.
pub const MAX_THREAD_PRIORITY: u32 = 32;

/// Smallest stack (in machine words) a thread may be created with. Must hold
/// the guard word, a full initial exception frame and some working space.
pub const MIN_STACK_WORDS: usize = 64;

/// Size of each core's synthetic idle stack, in machine words.
pub const IDLE_STACK_WORDS: usize = 64;

/// How long thread-table operations wait for the table lock.
pub const THREAD_TABLE_TIMEOUT_US: u64 = 1_000;

/// Overall bound on waiting for the other core to leave its exclusive section.
pub const EXCLUSIVE_SECTION_TIMEOUT_US: u64 = 1_000_000;

/// Bound on waiting for the other core to acknowledge a new exclusive section.
pub const EXCLUSIVE_ACK_TIMEOUT_US: u64 = 10_000;

/// Bound on acquiring the global word that guards the exclusive-section counts.
pub const EXCLUSIVE_LOCK_TIMEOUT_US: u64 = 1_000;

/// SysTick frequency in Hz. One scheduling quantum per tick.
pub const TICK_HZ: u32 = 1_000;

/// Core clock feeding SysTick (HSI default after reset on STM32H7).
pub const SYSTEM_CLOCK_HZ: u32 = 64_000_000;

/// Pattern written to the lowest word of every thread stack. A thread whose
/// guard no longer matches has overflowed its stack.
pub const STACK_GUARD: usize = 0xDEAD_BEEF;

/// First identifier handed out by each handle generator. Starting away from
/// zero makes a zeroed backing block unlikely to match a live handle.
pub const FIRST_HANDLE_ID: i32 = 123;

const_assert!(CORE_COUNT == 2);
const_assert!(MAX_THREADS > 0 && MAX_THREADS < u8::MAX as usize);
const_assert!(MAX_THREAD_PRIORITY >= 1);
// Guard word + 17-word initial frame, with room to spare.
const_assert!(MIN_STACK_WORDS >= 1 + 17 + 8);
const_assert!(IDLE_STACK_WORDS >= 17 + 8);
const_assert!(EXCLUSIVE_ACK_TIMEOUT_US < EXCLUSIVE_SECTION_TIMEOUT_US);
const_assert!(EXCLUSIVE_LOCK_TIMEOUT_US <= EXCLUSIVE_ACK_TIMEOUT_US);
const_assert!(SYSTEM_CLOCK_HZ / TICK_HZ - 1 <= 0x00FF_FFFF);
