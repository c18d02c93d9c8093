//! # Tower RTOS
//!
//! A priority-preemptive real-time kernel for single-core ARM Cortex-M4
//! microcontrollers (developed on the Kinetis K70 tower board).
//!
//! ## Overview
//!
//! Every thread owns a unique priority, 0 being the most urgent. The
//! kernel always runs the most urgent ready thread; threads give up the
//! CPU only by waiting on a semaphore, delaying, or deleting themselves,
//! and are preempted whenever an interrupt or another thread readies a
//! more urgent one.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │           Application threads · device drivers          │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │  init · start · create/delete_thread · semaphore_*      │
//! │  time_delay/get/set · isr_enter/exit                    │
//! ├───────────────────────────┬────────────────────────────┤
//! │  Scheduler (scheduler.rs) │  Sync (sync.rs)            │
//! │  ─ TCB table · ready set  │  ─ critical sections       │
//! │  ─ ECB pool · tick clock  │  ─ interrupt enable/disable│
//! │  ─ ISR nesting depth      │                            │
//! ├───────────────────────────┴────────────────────────────┤
//! │  thread.rs · semaphore.rs · prio_bitmap.rs · tick.rs    │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │    PendSV · SysTick · Context Switch · Stack Init      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the arch port is plain safe Rust over index-based
//! tables, and builds (and is unit-tested) on the host. The API layer and
//! the port only exist on the bare-metal target.
//!
//! ## Memory Model
//!
//! - **No heap**: TCBs, ECBs and wait lists live in fixed-size arrays
//! - **Caller-owned stacks**: each thread runs on a `&'static mut [u32]`
//! - **Critical sections**: `cortex_m::interrupt::free()` around every
//!   kernel state change; nothing else is locked

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod prio_bitmap;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod tick;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod kernel;
#[cfg(all(target_arch = "arm", target_os = "none", feature = "rtt"))]
pub mod logger;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod sync;

pub use error::KernelError;
pub use semaphore::SemaphoreId;
pub use thread::{Priority, ThreadEntry, ThreadRef, ThreadState};
pub use tick::{Heartbeat, Ticks};

#[cfg(all(target_arch = "arm", target_os = "none"))]
#[doc(hidden)]
pub use cortex_m as __cortex_m;

/// Reserve a thread stack of `$words` 32-bit words.
///
/// Evaluates to `Option<&'static mut [u32]>`, which is `Some` only the
/// first time the expansion site runs.
///
/// ```ignore
/// let stack = thread_stack!(256).unwrap();
/// kernel::create_thread(worker, 0, stack, 3)?;
/// ```
#[cfg(all(target_arch = "arm", target_os = "none"))]
#[macro_export]
macro_rules! thread_stack {
    ($words:expr) => {
        $crate::__cortex_m::singleton!(: [u32; $words] = [0; $words])
            .map(|stack| stack as &'static mut [u32])
    };
}
