//! # Thread Control Block
//!
//! Defines the thread model for the kernel. Each thread owns a unique
//! priority, which doubles as its identity: every kernel call names a
//! thread by priority, and the scheduler maps priorities to TCB slots.

use crate::error::KernelError;
use crate::semaphore::SemaphoreId;
use crate::tick::Countdown;

/// Thread priority. 0 is the most urgent; `LOWEST_PRIORITY` is the idle
/// thread's.
pub type Priority = u8;

/// Thread entry point. Receives the argument given to `create_thread` in
/// `r0` and must never return.
pub type ThreadEntry = extern "C" fn(usize) -> !;

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// The running thread is simply the `Ready` thread the scheduler last
/// dispatched; there is no separate `Running` state.
///
/// ```text
///              create_thread()
///   ┌─────────┐ ─────────────► ┌─────────┐  semaphore_wait()  ┌────────────────────┐
///   │ Dormant │                │  Ready  │ ─────────────────► │ BlockedOnSemaphore │
///   └─────────┘ ◄───────────── └─────────┘ ◄───────────────── └────────────────────┘
///              delete_thread()   │     ▲     signal / timeout
///                                │     │
///                   time_delay() ▼     │ delay expired
///                              ┌─────────┐
///                              │ Delayed │
///                              └─────────┘
/// ```
///
/// `delete_thread()` returns a thread to `Dormant` from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot is free. The priority may be (re)created.
    Dormant,
    /// Runnable; the most urgent ready thread is the one executing.
    Ready,
    /// Waiting on a semaphore, optionally with a timeout.
    BlockedOnSemaphore,
    /// Sleeping until its delay expires.
    Delayed,
}

/// Why a thread last left `BlockedOnSemaphore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Signalled,
    TimedOut,
}

/// Names the thread a call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRef {
    /// The calling thread, whatever its priority.
    Current,
    Priority(Priority),
}

impl From<Priority> for ThreadRef {
    fn from(priority: Priority) -> Self {
        Self::Priority(priority)
    }
}

/// Saved machine context of a thread that is not executing.
///
/// Holds the thread's stack pointer as an address; the registers themselves
/// live on the thread's stack. Only the port layer interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedContext {
    sp: usize,
}

impl SavedContext {
    pub const NONE: Self = Self { sp: 0 };

    #[inline]
    pub fn from_stack_pointer(sp: *mut u32) -> Self {
        Self { sp: sp as usize }
    }

    #[inline]
    pub fn stack_pointer(&self) -> *mut u32 {
        self.sp as *mut u32
    }
}

// ---------------------------------------------------------------------------
// Stack sizing
// ---------------------------------------------------------------------------

/// Words of the frame a thread that has never run starts from: R4-R11 and
/// EXC_RETURN saved by the context switch, then the 8-word exception frame.
pub const INITIAL_FRAME_WORDS: usize = 17;

/// Usable top of a stack of `len` words starting at address `base`, as a
/// word index. The top is rounded down to 8 bytes (AAPCS), which may cost
/// one word.
///
/// Fails with `StackTooSmall` if the initial frame does not fit below it.
pub fn stack_top(base: usize, len: usize) -> Result<usize, KernelError> {
    let end = base.wrapping_add(len.wrapping_mul(4));
    let top = if end % 8 != 0 { len.saturating_sub(1) } else { len };
    if top < INITIAL_FRAME_WORDS {
        return Err(KernelError::StackTooSmall);
    }
    Ok(top)
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block (TCB). Stored in a fixed array in the scheduler;
/// a slot is free for reuse whenever it is `Dormant`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadControlBlock {
    pub state: ThreadState,

    pub priority: Priority,

    /// Saved stack pointer. Written by the context switch whenever the
    /// thread is switched out.
    pub context: SavedContext,

    /// Ticks until a `Delayed` thread, or a semaphore wait with a timeout,
    /// becomes ready regardless of signals.
    pub timeout: Option<Countdown>,

    /// Semaphore this thread is queued on. `Some` exactly while the state
    /// is `BlockedOnSemaphore`.
    pub waiting_on: Option<SemaphoreId>,

    /// Outcome of the last semaphore wait, set by whichever of signal or
    /// timeout wins.
    pub wake_reason: Option<WakeReason>,
}

impl ThreadControlBlock {
    pub const EMPTY: Self = Self {
        state: ThreadState::Dormant,
        priority: 0,
        context: SavedContext::NONE,
        timeout: None,
        waiting_on: None,
        wake_reason: None,
    };

    /// Bring a dormant slot to life as a ready thread.
    pub fn activate(&mut self, priority: Priority, context: SavedContext) {
        *self = Self {
            state: ThreadState::Ready,
            priority,
            context,
            ..Self::EMPTY
        };
    }

    /// Return the slot to `Dormant`, dropping all wait bookkeeping.
    pub fn retire(&mut self) {
        *self = Self {
            priority: self.priority,
            ..Self::EMPTY
        };
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != ThreadState::Dormant
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ThreadState::Ready
    }

    /// Queue on `semaphore`, optionally for at most `timeout`.
    pub fn block_on(&mut self, semaphore: SemaphoreId, timeout: Option<Countdown>) {
        self.state = ThreadState::BlockedOnSemaphore;
        self.waiting_on = Some(semaphore);
        self.timeout = timeout;
        self.wake_reason = None;
    }

    /// Sleep until `delay` runs out.
    pub fn delay_for(&mut self, delay: Countdown) {
        self.state = ThreadState::Delayed;
        self.timeout = Some(delay);
    }

    /// Leave a blocked or delayed state. Only the first wake after a block
    /// takes effect; the caller checks the state first.
    pub fn wake(&mut self, reason: Option<WakeReason>) {
        self.state = ThreadState::Ready;
        self.timeout = None;
        self.waiting_on = None;
        self.wake_reason = reason;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
