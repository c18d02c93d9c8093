//! # Kernel
//!
//! The global kernel instance and the public API used by application
//! threads and device drivers.
//!
//! Every call runs its scheduler transition inside one critical section.
//! A call made from thread mode then performs any dispatch it made due
//! right away; a call made from an ISR leaves it to the outermost
//! [`isr_exit`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()          ← Tick rate, idle thread, heartbeat
//!         ├─► kernel::create_thread() ← Register threads (×N)
//!         └─► kernel::start()         ← Launch scheduler (no return)
//!               ├─► Set interrupt priorities
//!               ├─► Configure SysTick
//!               └─► Start the most urgent thread
//! ```
//!
//! ## Interrupt Handlers
//!
//! Every ISR that may call into the kernel is bracketed:
//!
//! ```ignore
//! #[interrupt]
//! fn PIT0() {
//!     kernel::isr_enter();
//!     // acknowledge the device, then e.g.
//!     let _ = kernel::semaphore_signal(PIT_SEMAPHORE);
//!     kernel::isr_exit();
//! }
//! ```

use core::cell::RefCell;

use cortex_m::interrupt::Mutex;

use crate::arch::cortex_m4;
use crate::config::{IDLE_STACK_WORDS, TICK_HZ};
use crate::error::KernelError;
use crate::scheduler::{Deleted, Scheduler, WaitOutcome};
use crate::semaphore::SemaphoreId;
use crate::sync;
use crate::thread::{self, Priority, SavedContext, ThreadEntry, ThreadRef};
use crate::tick::{Heartbeat, HeartbeatDivider, Ticks};

pub use crate::sync::{disable_interrupts, enable_interrupts};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

struct Kernel {
    scheduler: Scheduler,
    core_clock_hz: u32,
    heartbeat: Option<&'static dyn Heartbeat>,
    divider: HeartbeatDivider,
}

static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel {
    scheduler: Scheduler::new(),
    core_clock_hz: 0,
    heartbeat: None,
    divider: HeartbeatDivider::new(),
}));

/// Run `f` on the kernel state with interrupts disabled.
fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    sync::critical_section(|cs| f(&mut KERNEL.borrow(cs).borrow_mut()))
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    with_kernel(|k| f(&mut k.scheduler))
}

/// Run a thread-mode scheduler call and switch away if it readied a more
/// urgent thread or blocked the caller.
fn thread_call<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let (r, pending) = with_scheduler(|s| {
        let r = f(s);
        (r, s.dispatch_pending())
    });
    if pending {
        cortex_m4::trigger_pendsv();
    }
    r
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Prepare the kernel for use: records the core clock for the tick source,
/// creates the idle thread and installs the optional heartbeat, which is
/// toggled every half second from the tick interrupt.
///
/// Must precede every other call. Calling it again has no effect.
pub fn init(core_clock_hz: u32, heartbeat: Option<&'static dyn Heartbeat>) {
    let Some(idle_stack) = cortex_m::singleton!(: [u32; IDLE_STACK_WORDS] = [0; IDLE_STACK_WORDS])
    else {
        log::warn!("kernel already initialised");
        return;
    };

    let idle = thread::stack_top(idle_stack.as_ptr() as usize, IDLE_STACK_WORDS).and_then(move |top| {
        with_kernel(move |k| {
            k.core_clock_hz = core_clock_hz;
            k.heartbeat = heartbeat;
            k.scheduler.create_idle_thread(move || {
                cortex_m4::init_stack(idle_stack, top, idle_thread, 0)
            })
        })
    });
    if let Err(e) = idle {
        log::error!("idle thread: {e}");
    }

    log::info!("kernel initialised, {} Hz core clock, {TICK_HZ} Hz tick", core_clock_hz);
}

/// Start multithreading. **Does not return.**
///
/// Consuming the core peripherals ensures it runs only once.
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    sync::disable_interrupts();

    cortex_m4::set_interrupt_priorities(&mut core_peripherals.SCB);

    let (first, core_clock_hz) = with_kernel(|k| (k.scheduler.start(), k.core_clock_hz));
    let Some(first) = first else {
        // `init` was never called; there is nothing to run
        log::error!("start without threads");
        loop {
            cortex_m::asm::wfi();
        }
    };

    cortex_m4::configure_systick(&mut core_peripherals.SYST, core_clock_hz);

    unsafe { cortex_m4::start_first_thread(first.stack_pointer()) }
}

/// Create a thread running `entry(arg)` on `stack` at `priority`.
///
/// Threads can be created before `start` or by a running thread, never by
/// an ISR. A newly created thread more urgent than the caller runs
/// immediately. Fails with [`KernelError::StackTooSmall`] before touching
/// the kernel if `stack` cannot hold the initial frame.
pub fn create_thread(
    entry: ThreadEntry,
    arg: usize,
    stack: &'static mut [u32],
    priority: Priority,
) -> Result<(), KernelError> {
    let top = thread::stack_top(stack.as_ptr() as usize, stack.len())?;
    thread_call(move |s| {
        s.create_thread(priority, move || cortex_m4::init_stack(stack, top, entry, arg))
    })
}

/// Delete a thread, returning it to `Dormant` so its priority can be
/// created again.
///
/// Deleting the caller (by [`ThreadRef::Current`] or its own priority)
/// never returns; the next most urgent ready thread runs instead.
pub fn delete_thread(target: impl Into<ThreadRef>) -> Result<(), KernelError> {
    match thread_call(|s| s.delete_thread(target.into()))? {
        Deleted::Other => Ok(()),
        // PendSV has already switched away for good
        Deleted::Current => loop {
            cortex_m::asm::wfi();
        },
    }
}

/// Allocate a semaphore with `initial_count` units. `None` once the ECB
/// pool is exhausted.
pub fn semaphore_create(initial_count: u32) -> Option<SemaphoreId> {
    with_scheduler(|s| s.semaphore_create(initial_count))
}

/// Signal a semaphore. Callable from threads and ISRs.
pub fn semaphore_signal(semaphore: SemaphoreId) -> Result<(), KernelError> {
    thread_call(|s| s.semaphore_signal(semaphore))
}

/// Wait on a semaphore for at most `timeout` ticks (0 waits forever).
///
/// Returns [`KernelError::Timeout`] if the timeout expired first. Thread
/// context only.
pub fn semaphore_wait(semaphore: SemaphoreId, timeout: Ticks) -> Result<(), KernelError> {
    match thread_call(|s| s.semaphore_wait(semaphore, timeout))? {
        WaitOutcome::Acquired => Ok(()),
        // Resumed by a signal or the tick interrupt
        WaitOutcome::Blocked => with_scheduler(|s| s.wait_result()),
    }
}

/// Sleep for `ticks` ticks. A zero delay returns at once without
/// rescheduling.
///
/// The delay ends on the `ticks`-th tick interrupt, so the time actually
/// slept is up to one tick short; ask for one more tick for a lower bound.
pub fn time_delay(ticks: Ticks) -> Result<(), KernelError> {
    thread_call(|s| s.time_delay(ticks)).map(|_| ())
}

/// Current value of the system clock, in ticks.
pub fn time_get() -> Ticks {
    with_scheduler(|s| s.time_get())
}

/// Set the system clock.
pub fn time_set(ticks: Ticks) {
    with_scheduler(|s| s.time_set(ticks))
}

/// Notify the kernel that an ISR has begun. Must be the first thing every
/// kernel-aware ISR does.
pub fn isr_enter() {
    with_scheduler(|s| s.isr_enter())
}

/// Notify the kernel that an ISR is done. When the outermost handler
/// exits and a more urgent thread became ready, the interrupt returns to
/// that thread instead of the interrupted one.
pub fn isr_exit() {
    if with_scheduler(|s| s.isr_exit()) {
        cortex_m4::trigger_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Port entry points
// ---------------------------------------------------------------------------

/// Advance the system clock. Called by the SysTick handler between
/// `isr_enter` and `isr_exit`.
pub(crate) fn tick() {
    let heartbeat = with_kernel(|k| {
        k.scheduler.tick();
        if k.divider.tick() {
            k.heartbeat
        } else {
            None
        }
    });
    if let Some(heartbeat) = heartbeat {
        heartbeat.toggle();
    }
}

/// Context switch core, called from PendSV.
pub(crate) fn switch_context(outgoing: SavedContext) -> SavedContext {
    with_scheduler(|s| s.switch_context(outgoing))
}

extern "C" fn idle_thread(_: usize) -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}
