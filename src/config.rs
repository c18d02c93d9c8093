//! # Kernel Configuration
//!
//! Compile-time constants governing the kernel's fixed-size pools and time
//! base. All limits are fixed at compile time; there is no dynamic allocation.

use crate::thread::Priority;

/// Number of distinct priority levels, including the idle thread's.
/// Bounded by the width of the ready bitmap (one `u32`).
pub const PRIORITY_LEVELS: usize = 32;

/// Size of the TCB table: the maximum number of live threads, including
/// the idle thread. May be smaller than `PRIORITY_LEVELS` to save RAM;
/// priorities stay sparse, the table does not.
pub const MAX_THREADS: usize = 16;

/// Maximum number of user threads (every slot except the idle thread's).
pub const MAX_USER_THREADS: usize = MAX_THREADS - 1;

/// Lowest (numerically largest) priority. Reserved for the idle thread.
pub const LOWEST_PRIORITY: Priority = (PRIORITY_LEVELS - 1) as Priority;

/// Size of the event control block pool. Semaphores are never destroyed,
/// so this bounds the number of `semaphore_create` calls over the
/// lifetime of the system.
pub const MAX_SEMAPHORES: usize = 32;

/// Deepest interrupt nesting the thread stacks are sized for. Every nested
/// level stacks another hardware exception frame on the main stack.
pub const MAX_ISR_NESTING: u32 = 8;

/// SysTick frequency in Hz. One tick is the unit of every delay and
/// timeout.
pub const TICK_HZ: u32 = 1000;

/// Ticks between heartbeat toggles (half a second).
pub const HEARTBEAT_PERIOD_TICKS: u32 = TICK_HZ / 2;

/// Stack size of the kernel-owned idle thread, in words. The idle thread
/// only executes `wfi`, so it needs little more than an exception frame.
pub const IDLE_STACK_WORDS: usize = 128;

/// Suggested stack size for application threads, in words.
pub const THREAD_STACK_WORDS: usize = 256;
