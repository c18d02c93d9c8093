//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions for the Cortex-M4.
//! On a single core, masking interrupts is the kernel's only lock: all
//! scheduler state is mutated inside [`critical_section`], and drivers that
//! share data with their ISRs use the same bracket.

use cortex_m::interrupt;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored to their previous state
/// on exit, so critical sections nest.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&interrupt::CriticalSection) -> R,
{
    interrupt::free(f)
}

/// Mask all configurable interrupts (`cpsid i`).
///
/// Pairs with [`enable_interrupts`] for drivers whose critical section does
/// not fit a closure, e.g. a byte queue updated from both a thread and an
/// ISR. Prefer [`critical_section`] where it fits.
#[inline]
pub fn disable_interrupts() {
    interrupt::disable();
}

/// Unmask interrupts (`cpsie i`).
///
/// # Safety
/// Must not be called inside a [`critical_section`] or any other code that
/// relies on interrupts staying masked.
#[inline]
pub unsafe fn enable_interrupts() {
    interrupt::enable();
}
