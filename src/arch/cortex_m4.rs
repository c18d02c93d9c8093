//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and the initial thread stack frame. This is the only module that
//! writes registers or interprets a saved stack pointer.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by threads in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR
//! (plus S0–S15 and FPSCR if the thread used the FPU) onto the process
//! stack. PendSV saves R4–R11, the EXC_RETURN value and, for FPU threads,
//! S16–S31 on top of that, which completes the saved context.
//!
//! ## Interrupt Priorities
//!
//! - PendSV: 0xFF (lowest). Pended by the kernel, taken only once every
//!   other handler has returned, i.e. at the outermost ISR exit
//! - SysTick: 0xE0, above PendSV, below every device interrupt

use core::arch::{asm, global_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m_rt::exception;

use crate::config::TICK_HZ;
use crate::kernel;
use crate::thread::{SavedContext, ThreadEntry, INITIAL_FRAME_WORDS};

/// Software-saved words: R4–R11 and EXC_RETURN.
const SW_FRAME_WORDS: usize = 9;

/// Hardware-stacked words without FPU state: R0–R3, R12, LR, PC, xPSR.
const HW_FRAME_WORDS: usize = 8;

const _: () = assert!(SW_FRAME_WORDS + HW_FRAME_WORDS == INITIAL_FRAME_WORDS);

/// Return to Thread mode on PSP, basic (non-FPU) frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 0x0100_0000;

const PENDSV_PRIORITY: u8 = 0xFF;
const SYSTICK_PRIORITY: u8 = 0xE0;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST, core_clock_hz: u32) {
    let reload = core_clock_hz / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Put PendSV below everything and SysTick just above it.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    unsafe {
        scb.set_priority(SystemHandler::PendSV, PENDSV_PRIORITY);
        scb.set_priority(SystemHandler::SysTick, SYSTICK_PRIORITY);
    }
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Request a context switch.
///
/// From thread mode the switch happens before this function returns. From
/// a handler it happens when the outermost handler returns.
#[inline]
pub fn trigger_pendsv() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Stack initialization
// ---------------------------------------------------------------------------

/// Build the initial frame of a new thread below word `top` of `stack`.
///
/// The frame looks exactly like one PendSV left behind, so the thread's
/// first dispatch is an ordinary context restore.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]
///   xPSR  (Thumb bit set)
///   PC    (thread entry point)
///   LR    (thread_exit)
///   R12   (0)
///   R3    (0)
///   R2    (0)
///   R1    (0)
///   R0    (argument)
/// [Software saved context]
///   EXC_RETURN (Thread mode, PSP, no FPU state)
///   R11   (0)
///   ...
///   R4    (0)              <- saved stack pointer
/// ```
///
/// `top` must come from [`crate::thread::stack_top`] for this `stack`,
/// which guarantees the frame fits and ends 8-byte aligned.
pub fn init_stack(
    stack: &'static mut [u32],
    top: usize,
    entry: ThreadEntry,
    arg: usize,
) -> SavedContext {
    let frame = &mut stack[top - INITIAL_FRAME_WORDS..top];
    frame.fill(0);
    frame[8] = EXC_RETURN_THREAD_PSP;
    frame[9] = arg as u32;
    frame[14] = thread_exit as usize as u32;
    frame[15] = entry as usize as u32 & !1;
    frame[16] = XPSR_THUMB;

    SavedContext::from_stack_pointer(frame.as_mut_ptr())
}

/// Landing pad for a thread entry that returns, which `ThreadEntry`'s
/// signature rules out. Parks the CPU.
extern "C" fn thread_exit() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// First thread launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and start executing the thread whose saved
/// context is `sp`, unwinding its initial frame by hand.
///
/// # Safety
/// Must be called once, from `kernel::start`, with interrupts disabled and
/// `sp` produced by [`init_stack`].
pub unsafe fn start_first_thread(sp: *mut u32) -> ! {
    asm!(
        // Skip the software frame (R4-R11, EXC_RETURN)
        "adds r0, #36",
        "msr psp, r0",

        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unwind the hardware frame
        "pop {{r0-r3, r12}}",  // R0 carries the thread argument
        "pop {{r4}}",          // LR (thread_exit)
        "pop {{r5}}",          // PC (entry point)
        "pop {{r6}}",          // xPSR (discarded)
        "mov lr, r4",
        "orr r5, r5, #1",      // bx needs the Thumb bit

        "cpsie i",
        "bx r5",
        in("r0") sp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

// Save the outgoing context onto its PSP stack, let the scheduler swap
// saved stack pointers, restore the incoming context.
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    ".fpu fpv4-sp-d16",
    "PendSV:",
    "    cpsid i",
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
    "    cpsie i",
    "    bx lr",
    ".size PendSV, . - PendSV",
    switch = sym switch_context,
);

/// Called from PendSV with the outgoing thread's saved stack pointer;
/// returns the incoming thread's.
extern "C" fn switch_context(sp: *mut u32) -> *mut u32 {
    kernel::switch_context(SavedContext::from_stack_pointer(sp)).stack_pointer()
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// Kernel tick. Bracketed like every other ISR, so a thread readied by a
/// timeout preempts on return.
#[exception]
fn SysTick() {
    kernel::isr_enter();
    kernel::tick();
    kernel::isr_exit();
}
