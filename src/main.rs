//! # Tower RTOS Demo Firmware
//!
//! Exercises the kernel with a small producer/consumer system:
//!
//! | Thread | Priority | Behavior |
//! |--------|----------|----------|
//! | `init_thread` | 0 | Creates the semaphores and workers, then deletes itself |
//! | `sampler_thread` | 2 | Signals `samples` every 100 ticks |
//! | `filter_thread` | 3 | Waits on `samples` with a 250 tick timeout, forwards to `results` |
//! | `report_thread` | 5 | Waits on `results` forever, logs the running count |
//! | idle | 31 | Created by `kernel::init` |
//!
//! The heartbeat flips every 500 ticks from the tick interrupt.
//!
//! Hosted builds (e.g. `cargo test`) get an empty `main`; the firmware
//! only exists for the bare-metal target.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::fmt;
    use core::sync::atomic::{AtomicBool, Ordering};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use tower_rtos::config::THREAD_STACK_WORDS;
    use tower_rtos::{kernel, thread_stack, Heartbeat, KernelError, SemaphoreId, ThreadRef};

    /// Core clock after reset (internal reference, FLL engaged).
    const CORE_CLOCK_HZ: u32 = 20_971_520;

    const SAMPLE_PERIOD: u32 = 100;
    const SAMPLE_TIMEOUT: u32 = 250;

    /// Heartbeat state. A board crate would drive a GPIO pin here.
    struct Led(AtomicBool);

    impl Heartbeat for Led {
        fn toggle(&self) {
            let on = !self.0.fetch_xor(true, Ordering::Relaxed);
            log::trace!("heartbeat {}", if on { "on" } else { "off" });
        }
    }

    static LED: Led = Led(AtomicBool::new(false));

    /// Why the workers could not be set up.
    #[derive(Debug)]
    enum SetupError {
        /// The semaphore pool is exhausted.
        NoSemaphore,
        /// A stack singleton was already taken.
        StackTaken,
        Kernel(KernelError),
    }

    impl From<KernelError> for SetupError {
        fn from(e: KernelError) -> Self {
            Self::Kernel(e)
        }
    }

    impl fmt::Display for SetupError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::NoSemaphore => f.write_str("semaphore pool exhausted"),
                Self::StackTaken => f.write_str("thread stack already in use"),
                Self::Kernel(e) => write!(f, "{e}"),
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Threads
    // ---------------------------------------------------------------------------

    /// Sets up the rest of the system from thread context, then gets out of
    /// the way.
    extern "C" fn init_thread(_: usize) -> ! {
        if let Err(e) = spawn_workers() {
            log::error!("init: {e}");
        }
        // Never returns on success
        let _ = kernel::delete_thread(ThreadRef::Current);
        loop {
            cortex_m::asm::wfi();
        }
    }

    fn spawn_workers() -> Result<(), SetupError> {
        let (Some(samples), Some(results)) =
            (kernel::semaphore_create(0), kernel::semaphore_create(0))
        else {
            return Err(SetupError::NoSemaphore);
        };

        // Only the first run of each expansion site yields a stack
        let stacks = (
            thread_stack!(THREAD_STACK_WORDS),
            thread_stack!(THREAD_STACK_WORDS),
            thread_stack!(THREAD_STACK_WORDS),
        );
        let (Some(s0), Some(s1), Some(s2)) = stacks else {
            return Err(SetupError::StackTaken);
        };

        // Arguments are packed as `samples | results << 8` for the filter
        let filter_arg = usize::from(samples) | usize::from(results) << 8;

        kernel::create_thread(report_thread, results.into(), s2, 5)?;
        kernel::create_thread(filter_thread, filter_arg, s1, 3)?;
        kernel::create_thread(sampler_thread, samples.into(), s0, 2)?;
        log::info!("workers running");
        Ok(())
    }

    extern "C" fn sampler_thread(arg: usize) -> ! {
        let samples = SemaphoreId::from_raw(arg);
        loop {
            let _ = kernel::time_delay(SAMPLE_PERIOD);
            if let Err(e) = kernel::semaphore_signal(samples) {
                log::warn!("sampler: {e}");
            }
        }
    }

    extern "C" fn filter_thread(arg: usize) -> ! {
        let samples = SemaphoreId::from_raw(arg & 0xff);
        let results = SemaphoreId::from_raw(arg >> 8);
        loop {
            match kernel::semaphore_wait(samples, SAMPLE_TIMEOUT) {
                Ok(()) => {
                    let _ = kernel::semaphore_signal(results);
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("filter: no sample by tick {}", kernel::time_get());
                }
                Err(e) => log::error!("filter: {e}"),
            }
        }
    }

    extern "C" fn report_thread(arg: usize) -> ! {
        let results = SemaphoreId::from_raw(arg);
        let mut count: u32 = 0;
        loop {
            if kernel::semaphore_wait(results, 0).is_ok() {
                count = count.wrapping_add(1);
                log::debug!("{count} results at tick {}", kernel::time_get());
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Main entry point
    // ---------------------------------------------------------------------------

    /// Firmware entry point. Initializes the kernel, creates the init thread
    /// and starts the scheduler. Does not return.
    #[entry]
    fn main() -> ! {
        let Some(cp) = cortex_m::Peripherals::take() else {
            loop {
                cortex_m::asm::wfi();
            }
        };

        #[cfg(feature = "rtt")]
        tower_rtos::logger::init(log::LevelFilter::Debug);

        kernel::init(CORE_CLOCK_HZ, Some(&LED));

        let created = thread_stack!(THREAD_STACK_WORDS)
            .ok_or(SetupError::StackTaken)
            .and_then(|stack| {
                kernel::create_thread(init_thread, 0, stack, 0).map_err(SetupError::Kernel)
            });
        if let Err(e) = created {
            log::error!("init thread: {e}");
        }

        kernel::start(cp)
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {}
