//! # Cortex-M7/M4 Port Layer
//!
//! Hardware-specific code for the dual-core ARMv7E-M target (Cortex-M7 +
//! Cortex-M4). Implements the initial exception frame, the PendSV context
//! switch, SysTick configuration, and the [`Port`](crate::port::Port)
//! services the kernel consumes, including the deep-sleep halt that ends a
//! coordinated shutdown.
//!
//! ## Context Switch Mechanism
//!
//! Threads run in Thread mode on the **PSP**; handlers run on the **MSP**.
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR (plus
//! S0–S15/FPSCR for threads that touched the FPU) onto the process stack.
//! PendSV saves the rest (R4–R11, EXC_RETURN, and S16–S31 when the FPU
//! frame is active), hands the resulting stack pointer to
//! [`Kernel::switch_context`](crate::kernel::Kernel::switch_context), and
//! restores whatever context it gets back.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest), so a switch never preempts a handler
//!
//! The frame layout below is plain data and builds on every target; the
//! handlers and the port are compiled only for bare-metal ARM.

// ---------------------------------------------------------------------------
// Initial frame layout
// ---------------------------------------------------------------------------

/// Words pushed by PendSV: R4–R11 then EXC_RETURN.
pub const SW_FRAME_WORDS: usize = 9;
/// Words stacked by hardware: R0–R3, R12, LR, PC, xPSR.
pub const HW_FRAME_WORDS: usize = 8;
/// Size of a freshly built context.
pub const FULL_FRAME_WORDS: usize = SW_FRAME_WORDS + HW_FRAME_WORDS;

/// Word offsets inside a full frame, counted from the saved stack pointer.
pub const FRAME_EXC_RETURN: usize = 8;
pub const FRAME_R0: usize = SW_FRAME_WORDS;
pub const FRAME_LR: usize = SW_FRAME_WORDS + 5;
pub const FRAME_PC: usize = SW_FRAME_WORDS + 6;
pub const FRAME_XPSR: usize = SW_FRAME_WORDS + 7;

/// xPSR with only the Thumb bit set.
pub const INITIAL_XPSR: usize = 0x0100_0000;
/// Return to Thread mode on PSP, no FP context.
pub const INITIAL_EXC_RETURN: usize = 0xFFFF_FFFD;

/// AAPCS stack alignment at a public interface.
const STACK_ALIGN: usize = 8;

/// Build the context a thread starts from at the top of `stack`.
///
/// The frame is laid out so the first restore enters `entry` with `arg` in
/// R0 and `exit` as its return address. The top of the stack is aligned
/// down to 8 bytes first.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]
///   xPSR  (Thumb bit set)
///   PC    (entry, Thumb bit cleared)
///   LR    (exit continuation)
///   R12, R3, R2, R1 (0)
///   R0    (arg)
/// [Software saved context]
///   EXC_RETURN (0xFFFFFFFD)
///   R11 … R4 (0)          <- returned index
/// ```
///
/// # Returns
/// Word index of the saved stack pointer inside `stack`, or `None` if the
/// stack cannot hold a frame.
pub fn init_stack_frame(stack: &mut [usize], entry: usize, arg: usize, exit: usize) -> Option<usize> {
    let word = core::mem::size_of::<usize>();
    let base = stack.as_ptr() as usize;
    let top = (base + stack.len() * word) & !(STACK_ALIGN - 1);
    let top_index = top.checked_sub(base)? / word;
    let sp = top_index.checked_sub(FULL_FRAME_WORDS)?;

    let frame = &mut stack[sp..top_index];
    frame.fill(0);
    frame[FRAME_EXC_RETURN] = INITIAL_EXC_RETURN;
    frame[FRAME_R0] = arg;
    frame[FRAME_LR] = exit;
    frame[FRAME_PC] = entry & !1;
    frame[FRAME_XPSR] = INITIAL_XPSR;
    Some(sp)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use hw::{restart, shutdown, start, CortexMPort, KERNEL};

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod hw {
    use core::arch::global_asm;
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m::peripheral::scb::{SystemHandler, VectActive};
    use cortex_m::peripheral::syst::SystClkSource;
    use cortex_m::peripheral::{CPUID, SCB, SYST};

    use crate::config::{CORE_COUNT, SYSTEM_CLOCK_HZ, TICK_HZ};
    use crate::kernel::Kernel;
    use crate::port::{CoreId, Port};

    /// CPUID part number of the Cortex-M7.
    const CM7_PARTNO: u32 = 0xC27;

    /// SCB_SCR.SLEEPDEEP
    const SCR_SLEEPDEEP: u32 = 1 << 2;

    const US_PER_TICK: u64 = 1_000_000 / TICK_HZ as u64;

    /// The kernel shared by both cores. Must be linked into memory both
    /// cores can reach (AXI SRAM on the STM32H745).
    pub static KERNEL: Kernel<CortexMPort> = Kernel::new(CortexMPort);

    /// SysTick count per core; each core runs its own SysTick.
    static TICKS: [AtomicU32; CORE_COUNT] = [const { AtomicU32::new(0) }; CORE_COUNT];

    // -----------------------------------------------------------------------
    // Port implementation
    // -----------------------------------------------------------------------

    /// [`Port`] for the Cortex-M7/M4 pair.
    pub struct CortexMPort;

    impl Port for CortexMPort {
        fn now(&self) -> u64 {
            let ticks = &TICKS[self.current_core().index()];
            let reload = SYST::get_reload() as u64;
            loop {
                let before = ticks.load(Ordering::Acquire);
                let current = SYST::get_current() as u64;
                if ticks.load(Ordering::Acquire) == before {
                    let sub_tick = (reload - current.min(reload)) * US_PER_TICK / (reload + 1);
                    return before as u64 * US_PER_TICK + sub_tick;
                }
            }
        }

        fn current_core(&self) -> CoreId {
            // SAFETY: read-only identification register.
            let cpuid = unsafe { (*CPUID::PTR).base.read() };
            if (cpuid >> 4) & 0xFFF == CM7_PARTNO {
                CoreId::Cm7
            } else {
                CoreId::Cm4
            }
        }

        fn in_interrupt(&self) -> bool {
            SCB::vect_active() != VectActive::ThreadMode
        }

        fn disable_interrupts(&self) {
            cortex_m::interrupt::disable();
        }

        fn enable_interrupts(&self) {
            // SAFETY: only called when the outermost critical section ends.
            unsafe { cortex_m::interrupt::enable() }
        }

        fn request_context_switch(&self) {
            SCB::set_pendsv();
        }

        fn signal_peer(&self) {
            cortex_m::asm::dsb();
            cortex_m::asm::sev();
        }

        fn wait_for_interrupt(&self) {
            cortex_m::asm::dsb();
            cortex_m::asm::wfi();
        }

        fn thread_exit_address(&self) -> usize {
            thread_exit as usize
        }

        fn idle_entry_address(&self) -> usize {
            idle_loop as usize
        }

        fn halt(&self) -> ! {
            // SAFETY: SLEEPDEEP only selects the low-power mode `wfe` enters.
            unsafe { (*SCB::PTR).scr.modify(|scr| scr | SCR_SLEEPDEEP) };
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            loop {
                cortex_m::asm::wfe();
            }
        }
    }

    /// Return address of every thread entry.
    extern "C" fn thread_exit() -> ! {
        KERNEL.exit()
    }

    extern "C" fn idle_loop() -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }

    // -----------------------------------------------------------------------
    // SysTick and priorities
    // -----------------------------------------------------------------------

    fn configure_systick(syst: &mut SYST) {
        let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
        syst.set_reload(reload);
        syst.clear_current();
        syst.set_clock_source(SystClkSource::Core);
        syst.enable_counter();
        syst.enable_interrupt();
    }

    fn set_interrupt_priorities(scb: &mut SCB) {
        // SAFETY: lowering these two handlers cannot break priority-based
        // critical sections, which are not used.
        unsafe {
            scb.set_priority(SystemHandler::PendSV, 0xFF);
            scb.set_priority(SystemHandler::SysTick, 0xFF);
        }
    }

    /// Start scheduling on the calling core. **Does not return.**
    ///
    /// Threads for this core should be created first. Thread mode keeps the
    /// MSP until the first PendSV; the context saved by that switch lands
    /// on the idle stack and is discarded.
    pub fn start(syst: &mut SYST, scb: &mut SCB) -> ! {
        configure_systick(syst);
        set_interrupt_priorities(scb);
        // SAFETY: PSP is unused until the first PendSV.
        unsafe { cortex_m::register::psp::write(KERNEL.idle_stack_top() as u32) };
        KERNEL.port().request_context_switch();
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// Stop both cores in deep sleep. **Does not return.**
    ///
    /// The other core joins from its next SysTick or inter-core event.
    pub fn shutdown() -> ! {
        KERNEL.shutdown()
    }

    /// Request a system reset. **Does not return.**
    pub fn restart() -> ! {
        KERNEL.enter_critical();
        SCB::sys_reset()
    }

    // -----------------------------------------------------------------------
    // Exception handlers
    // -----------------------------------------------------------------------

    #[no_mangle]
    pub unsafe extern "C" fn SysTick() {
        TICKS[KERNEL.port().current_core().index()].fetch_add(1, Ordering::Release);
        KERNEL.on_tick();
    }

    extern "C" fn switch_context_trampoline(saved_sp: *mut usize) -> *mut usize {
        KERNEL.switch_context(saved_sp)
    }

    // PendSV: save the outgoing context onto its own PSP stack, let the
    // kernel pick the next one, restore it. Bit 4 of EXC_RETURN is clear
    // when the hardware stacked an FP frame, in which case S16–S31 are
    // callee-saved state of the thread as well.
    global_asm!(
        ".section .text.PendSV,\"ax\",%progbits",
        ".global PendSV",
        ".type PendSV,%function",
        ".thumb_func",
        ".fpu fpv4-sp-d16",
        "PendSV:",
        "    mrs r0, psp",
        "    tst lr, #0x10",
        "    it eq",
        "    vstmdbeq r0!, {{s16-s31}}",
        "    stmdb r0!, {{r4-r11, lr}}",
        "    bl {switch}",
        "    ldmia r0!, {{r4-r11, lr}}",
        "    tst lr, #0x10",
        "    it eq",
        "    vldmiaeq r0!, {{s16-s31}}",
        "    msr psp, r0",
        "    isb",
        "    bx lr",
        ".size PendSV, . - PendSV",
        switch = sym switch_context_trampoline,
    );
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: usize = 0x0800_1235;
    const EXIT: usize = 0x0800_2001;

    #[test]
    fn test_frame_registers() {
        let mut stack = vec![0xAAusize; 64];
        let sp = init_stack_frame(&mut stack, ENTRY, 42, EXIT).unwrap();
        let frame = &stack[sp..sp + FULL_FRAME_WORDS];

        assert!(frame[..FRAME_EXC_RETURN].iter().all(|&r| r == 0));
        assert_eq!(frame[FRAME_EXC_RETURN], INITIAL_EXC_RETURN);
        assert_eq!(frame[FRAME_R0], 42);
        assert!(frame[FRAME_R0 + 1..FRAME_LR].iter().all(|&r| r == 0));
        assert_eq!(frame[FRAME_LR], EXIT);
        assert_eq!(frame[FRAME_PC], ENTRY & !1);
        assert_eq!(frame[FRAME_XPSR], INITIAL_XPSR);
    }

    #[test]
    fn test_frame_top_is_aligned() {
        let mut stack = vec![0usize; 65];
        let sp = init_stack_frame(&mut stack, ENTRY, 0, EXIT).unwrap();
        let top = stack[sp..].as_ptr() as usize + FULL_FRAME_WORDS * core::mem::size_of::<usize>();
        assert_eq!(top % STACK_ALIGN, 0);
        assert!(sp + FULL_FRAME_WORDS <= stack.len());
    }

    #[test]
    fn test_words_below_frame_untouched() {
        let mut stack = vec![0x5555usize; 40];
        let sp = init_stack_frame(&mut stack, ENTRY, 0, EXIT).unwrap();
        assert!(stack[..sp].iter().all(|&w| w == 0x5555));
    }

    #[test]
    fn test_too_small_stack() {
        let mut stack = vec![0usize; FULL_FRAME_WORDS - 1];
        assert_eq!(init_stack_frame(&mut stack, ENTRY, 0, EXIT), None);
        assert_eq!(init_stack_frame(&mut [], ENTRY, 0, EXIT), None);
    }
}
