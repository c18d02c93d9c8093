//! Kernel error codes.
//!
//! Every kernel call either completes its state transition or fails with
//! one of these codes, leaving the kernel state untouched.
use core::fmt;

/// Error returned by a kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A semaphore wait expired before the semaphore was signalled.
    Timeout,
    /// The requested priority is already held by a live thread.
    PriorityExists,
    /// The requested priority is outside `0..=LOWEST_PRIORITY`, or is
    /// `LOWEST_PRIORITY` itself, which only the idle thread may hold.
    PriorityInvalid,
    /// The thread table has no free slot.
    NoMoreSlots,
    /// The stack given to `create_thread` cannot hold the initial frame.
    StackTooSmall,
    /// No live thread holds the priority named in a delete request.
    ThreadNotFound,
    /// The idle thread cannot be deleted.
    ThreadDeleteIdle,
    /// Threads cannot be deleted from interrupt context.
    ThreadDeleteIsr,
    /// A signal would take the semaphore count past `u32::MAX`.
    SemaphoreOverflow,
    /// The semaphore handle does not name an allocated semaphore.
    SemaphoreInvalid,
    /// A thread-only call was made from interrupt context, or before a
    /// thread was running.
    WrongContext,
}

impl KernelError {
    /// Whether a correct program can encounter this error in normal
    /// operation. Everything else points at a configuration or logic bug.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "semaphore wait timed out",
            Self::PriorityExists => "priority already in use",
            Self::PriorityInvalid => "priority out of range",
            Self::NoMoreSlots => "no free thread control blocks",
            Self::StackTooSmall => "thread stack too small",
            Self::ThreadNotFound => "no thread at that priority",
            Self::ThreadDeleteIdle => "cannot delete the idle thread",
            Self::ThreadDeleteIsr => "cannot delete a thread from an ISR",
            Self::SemaphoreOverflow => "semaphore count overflow",
            Self::SemaphoreInvalid => "invalid semaphore handle",
            Self::WrongContext => "call not allowed in this context",
        };
        f.write_str(msg)
    }
}
