//! # Scheduler
//!
//! The kernel's entire mutable state (TCB table, ready bitmap, ECB pool,
//! tick counter and ISR nesting depth) and every state transition on it.
//! This module never touches hardware or raw memory; the port layer calls
//! into it with interrupts disabled and performs the context switches it
//! asks for.
//!
//! ## Dispatch Rule
//!
//! The thread that should be executing is always the most urgent ready
//! thread, `ready.find_set()`. Whenever that differs from `current` a
//! dispatch is pending ([`Scheduler::needs_reschedule`]). Thread-context
//! calls act on a pending dispatch immediately; interrupt-context calls
//! leave it for the outermost [`Scheduler::isr_exit`].
//!
//! ## Timeouts
//!
//! Every tick, [`Scheduler::tick`] counts down the delay or timeout of
//! each delayed and timed-waiting thread and releases those that run out.
//! The countdowns do not depend on the clock value, so `time_set` leaves
//! them alone and any length up to `u32::MAX` ticks is honoured. A timed-out
//! waiter is pulled off its semaphore's wait list in the same critical
//! section, so a later signal can no longer find it and instead counts the
//! semaphore up. Whichever of signal and timeout runs first wins.

use crate::config::{LOWEST_PRIORITY, MAX_ISR_NESTING, MAX_THREADS, PRIORITY_LEVELS};
use crate::error::KernelError;
use crate::prio_bitmap::PrioBitmap;
use crate::semaphore::{SemaphoreId, SemaphorePool};
use crate::thread::{
    Priority, SavedContext, ThreadControlBlock, ThreadRef, ThreadState, WakeReason,
};
use crate::tick::{Countdown, Ticks};

/// Result of a semaphore wait attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A unit was available and has been taken.
    Acquired,
    /// The caller is now blocked. Switch away, then collect the outcome
    /// with [`Scheduler::wait_result`] once resumed.
    Blocked,
}

/// Which thread a successful delete removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    /// Another thread. The caller keeps running.
    Other,
    /// The calling thread. It must switch away and never resume.
    Current,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central kernel state. A single instance lives in `kernel.rs`
/// behind an interrupt-disabling mutex.
#[derive(Debug)]
pub struct Scheduler {
    /// Fixed-size TCB table. Slots are reused once `Dormant`.
    threads: [ThreadControlBlock; MAX_THREADS],

    /// Maps each live priority to its slot in `threads`.
    slot_of: [Option<u8>; PRIORITY_LEVELS],

    /// Priorities of all `Ready` threads.
    ready: PrioBitmap,

    semaphores: SemaphorePool,

    /// System clock. Wraps on overflow.
    ticks: Ticks,

    /// Number of active, possibly nested, interrupt handlers.
    isr_depth: u32,

    /// Priority of the thread that owns the CPU in thread mode. `None`
    /// before `start` and between a self-delete and the next dispatch.
    current: Option<Priority>,

    started: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            threads: [ThreadControlBlock::EMPTY; MAX_THREADS],
            slot_of: [None; PRIORITY_LEVELS],
            ready: PrioBitmap::EMPTY,
            semaphores: SemaphorePool::new(),
            ticks: 0,
            isr_depth: 0,
            current: None,
            started: false,
        }
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Register a new thread at `priority`. `LOWEST_PRIORITY` is reserved
    /// for [`Scheduler::create_idle_thread`].
    ///
    /// `init_context` builds the thread's initial stack frame. It is only
    /// invoked once every check has passed, so a failed call never touches
    /// the caller's stack region.
    pub fn create_thread(
        &mut self,
        priority: Priority,
        init_context: impl FnOnce() -> SavedContext,
    ) -> Result<(), KernelError> {
        if self.in_isr() {
            log::warn!("create_thread({priority}) from interrupt context");
            return Err(KernelError::WrongContext);
        }
        if priority >= LOWEST_PRIORITY {
            return Err(KernelError::PriorityInvalid);
        }
        self.activate_thread(priority, init_context)
    }

    /// Register the idle thread at `LOWEST_PRIORITY`.
    pub fn create_idle_thread(
        &mut self,
        init_context: impl FnOnce() -> SavedContext,
    ) -> Result<(), KernelError> {
        self.activate_thread(LOWEST_PRIORITY, init_context)
    }

    fn activate_thread(
        &mut self,
        priority: Priority,
        init_context: impl FnOnce() -> SavedContext,
    ) -> Result<(), KernelError> {
        if self.slot_of[priority as usize].is_some() {
            return Err(KernelError::PriorityExists);
        }
        let slot = self
            .threads
            .iter()
            .position(|tcb| !tcb.is_live())
            .ok_or(KernelError::NoMoreSlots)?;

        self.threads[slot].activate(priority, init_context());
        self.slot_of[priority as usize] = Some(slot as u8);
        self.ready.set(priority);

        log::debug!("thread {priority} created in slot {slot}");
        Ok(())
    }

    /// Return a live thread to `Dormant`, detaching it from the ready set
    /// and from any wait list.
    ///
    /// Naming the caller's own priority is the same as
    /// [`ThreadRef::Current`].
    pub fn delete_thread(&mut self, target: ThreadRef) -> Result<Deleted, KernelError> {
        if self.in_isr() {
            return Err(KernelError::ThreadDeleteIsr);
        }
        let priority = match target {
            ThreadRef::Current => self.current.ok_or(KernelError::WrongContext)?,
            ThreadRef::Priority(p) if p > LOWEST_PRIORITY => {
                return Err(KernelError::PriorityInvalid)
            }
            ThreadRef::Priority(p) => p,
        };
        if priority == LOWEST_PRIORITY {
            return Err(KernelError::ThreadDeleteIdle);
        }
        let slot = self.slot_of[priority as usize].ok_or(KernelError::ThreadNotFound)?;

        let tcb = &mut self.threads[slot as usize];
        if let Some(sem) = tcb.waiting_on {
            // The handle was valid when the thread queued on it
            if let Ok(ecb) = self.semaphores.get_mut(sem) {
                ecb.remove(priority);
            }
        }
        tcb.retire();
        self.slot_of[priority as usize] = None;
        self.ready.clear(priority);

        log::debug!("thread {priority} deleted");

        if self.current == Some(priority) {
            self.current = None;
            Ok(Deleted::Current)
        } else {
            Ok(Deleted::Other)
        }
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    /// Allocate a semaphore. `None` if the ECB pool is exhausted.
    pub fn semaphore_create(&mut self, initial_count: u32) -> Option<SemaphoreId> {
        let id = self.semaphores.create(initial_count);
        match id {
            Some(id) => log::debug!("semaphore {} created, count {initial_count}", id.index()),
            None => log::warn!("semaphore pool exhausted"),
        }
        id
    }

    /// Signal a semaphore: wake its most urgent waiter, or count up if
    /// nobody waits. Never blocks, so it is callable from any context.
    pub fn semaphore_signal(&mut self, id: SemaphoreId) -> Result<(), KernelError> {
        let ecb = self.semaphores.get_mut(id)?;
        match ecb.dequeue() {
            Some(waiter) => {
                log::trace!("semaphore {} wakes thread {waiter}", id.index());
                self.make_ready(waiter, Some(WakeReason::Signalled));
                Ok(())
            }
            None => ecb.give().map_err(|e| {
                log::warn!("semaphore {} overflow", id.index());
                e
            }),
        }
    }

    /// Take a unit from a semaphore, or block the calling thread on it.
    ///
    /// `timeout` is in ticks; 0 waits forever.
    pub fn semaphore_wait(
        &mut self,
        id: SemaphoreId,
        timeout: Ticks,
    ) -> Result<WaitOutcome, KernelError> {
        let current = self.thread_context()?;
        let ecb = self.semaphores.get_mut(id)?;
        if ecb.try_take() {
            return Ok(WaitOutcome::Acquired);
        }
        debug_assert_ne!(current, LOWEST_PRIORITY, "the idle thread must never block");

        ecb.enqueue(current);
        let slot = self.slot(current);
        self.threads[slot].block_on(id, Countdown::new(timeout));
        self.ready.clear(current);

        log::trace!("thread {current} waits on semaphore {}", id.index());
        Ok(WaitOutcome::Blocked)
    }

    /// Outcome of the calling thread's last blocking wait. Consumes it.
    pub fn wait_result(&mut self) -> Result<(), KernelError> {
        let current = self.thread_context()?;
        let slot = self.slot(current);
        match self.threads[slot].wake_reason.take() {
            Some(WakeReason::TimedOut) => Err(KernelError::Timeout),
            Some(WakeReason::Signalled) | None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Put the calling thread to sleep for `ticks` ticks. Returns whether
    /// the caller was delayed (and must switch away); a zero delay is a
    /// no-op.
    pub fn time_delay(&mut self, ticks: Ticks) -> Result<bool, KernelError> {
        let Some(delay) = Countdown::new(ticks) else {
            return Ok(false);
        };
        let current = self.thread_context()?;
        debug_assert_ne!(current, LOWEST_PRIORITY, "the idle thread must never block");

        let slot = self.slot(current);
        self.threads[slot].delay_for(delay);
        self.ready.clear(current);

        log::trace!("thread {current} delayed for {ticks} ticks");
        Ok(true)
    }

    /// Advance the clock by one tick and release every thread whose delay
    /// or timeout runs out on it.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);

        for slot in 0..MAX_THREADS {
            let tcb = &mut self.threads[slot];
            if !matches!(
                tcb.state,
                ThreadState::Delayed | ThreadState::BlockedOnSemaphore
            ) {
                continue;
            }
            if !tcb.timeout.as_mut().map_or(false, Countdown::tick) {
                continue;
            }

            let priority = tcb.priority;
            let reason = match (tcb.state, tcb.waiting_on) {
                (ThreadState::BlockedOnSemaphore, Some(sem)) => {
                    if let Ok(ecb) = self.semaphores.get_mut(sem) {
                        ecb.remove(priority);
                    }
                    log::trace!("thread {priority} timed out on semaphore {}", sem.index());
                    Some(WakeReason::TimedOut)
                }
                _ => None,
            };
            self.make_ready(priority, reason);
        }
    }

    #[inline]
    pub fn time_get(&self) -> Ticks {
        self.ticks
    }

    /// Set the system clock. Pending delays and timeouts keep the number
    /// of ticks they have left.
    #[inline]
    pub fn time_set(&mut self, ticks: Ticks) {
        self.ticks = ticks;
    }

    // -----------------------------------------------------------------------
    // Interrupt nesting
    // -----------------------------------------------------------------------

    /// Note entry into an interrupt handler.
    pub fn isr_enter(&mut self) {
        self.isr_depth += 1;
        debug_assert!(
            self.isr_depth <= MAX_ISR_NESTING,
            "interrupt nesting deeper than the stacks are sized for"
        );
    }

    /// Note exit from an interrupt handler. Returns `true` when this was
    /// the outermost handler and a more urgent thread than the interrupted
    /// one is ready, i.e. the port must switch on return.
    ///
    /// An unmatched call at depth 0 is ignored.
    pub fn isr_exit(&mut self) -> bool {
        let Some(depth) = self.isr_depth.checked_sub(1) else {
            log::warn!("isr_exit without isr_enter");
            return false;
        };
        self.isr_depth = depth;
        depth == 0 && self.needs_reschedule()
    }

    #[inline]
    pub fn in_isr(&self) -> bool {
        self.isr_depth > 0
    }

    #[inline]
    pub fn isr_depth(&self) -> u32 {
        self.isr_depth
    }

    // -----------------------------------------------------------------------
    // Dispatcher
    // -----------------------------------------------------------------------

    /// Whether the most urgent ready thread is not the current one.
    #[inline]
    pub fn needs_reschedule(&self) -> bool {
        self.started && self.ready.find_set() != self.current
    }

    /// Whether a thread-context caller must switch away right now.
    #[inline]
    pub fn dispatch_pending(&self) -> bool {
        !self.in_isr() && self.needs_reschedule()
    }

    /// Begin multithreading. Returns the context of the first thread to
    /// run, or `None` if nothing (not even the idle thread) exists.
    pub fn start(&mut self) -> Option<SavedContext> {
        if self.ready.is_empty() {
            return None;
        }
        self.started = true;
        let first = self.schedule();
        log::debug!("multithreading started with thread {first}");
        Some(self.threads[self.slot(first)].context)
    }

    /// Select the most urgent ready thread and make it current.
    ///
    /// Panics if no thread is ready; the idle thread never blocks, so this
    /// only happens if `start` was bypassed.
    pub fn schedule(&mut self) -> Priority {
        let next = self
            .ready
            .find_set()
            .expect("no ready thread; the idle thread must exist");
        if self.current != Some(next) {
            log::trace!("dispatch {:?} -> {next}", self.current);
        }
        self.current = Some(next);
        next
    }

    /// One complete context switch: store the outgoing thread's context,
    /// pick the next thread, and return its context.
    pub fn switch_context(&mut self, outgoing: SavedContext) -> SavedContext {
        if let Some(current) = self.current {
            let slot = self.slot(current);
            self.threads[slot].context = outgoing;
        }
        let next = self.schedule();
        self.threads[self.slot(next)].context
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[inline]
    pub fn current(&self) -> Option<Priority> {
        self.current
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// State of the thread at `priority`. Unoccupied priorities report
    /// `Dormant`; out-of-range ones report `None`.
    pub fn thread_state(&self, priority: Priority) -> Option<ThreadState> {
        let entry = self.slot_of.get(priority as usize)?;
        Some(entry.map_or(ThreadState::Dormant, |slot| {
            self.threads[slot as usize].state
        }))
    }

    #[inline]
    pub fn ready_set(&self) -> PrioBitmap {
        self.ready
    }

    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32, KernelError> {
        Ok(self.semaphores.get(id)?.count)
    }

    pub fn waiters(&self, id: SemaphoreId) -> Result<PrioBitmap, KernelError> {
        Ok(self.semaphores.get(id)?.wait_list)
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|tcb| tcb.is_live()).count()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Priority of the calling thread, for calls that may block.
    fn thread_context(&self) -> Result<Priority, KernelError> {
        if self.in_isr() {
            return Err(KernelError::WrongContext);
        }
        self.current.ok_or(KernelError::WrongContext)
    }

    /// Slot of a live priority. Callers only pass priorities they found in
    /// the ready set, a wait list, or `current`.
    fn slot(&self, priority: Priority) -> usize {
        match self.slot_of[priority as usize] {
            Some(slot) => slot as usize,
            None => unreachable!("priority {priority} has no TCB"),
        }
    }

    fn make_ready(&mut self, priority: Priority, reason: Option<WakeReason>) {
        let slot = self.slot(priority);
        self.threads[slot].wake(reason);
        self.ready.set(priority);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_SEMAPHORES, MAX_USER_THREADS};
    use quickcheck_macros::quickcheck;
    use std::vec::Vec;

    /// Fake stack pointer unique to each priority.
    fn ctx(priority: Priority) -> SavedContext {
        SavedContext::from_stack_pointer((0x2000_0000 + 0x400 * priority as usize) as *mut u32)
    }

    /// Plays the port layer: performs every dispatch the scheduler asks for
    /// and counts the context switches.
    struct Harness {
        s: Scheduler,
        switches: usize,
    }

    impl Harness {
        /// Idle thread plus `priorities`, multithreading started.
        fn with_threads(priorities: &[Priority]) -> Self {
            let _ = env_logger::try_init();
            let mut s = Scheduler::new();
            s.create_idle_thread(|| ctx(LOWEST_PRIORITY)).unwrap();
            for &p in priorities {
                s.create_thread(p, || ctx(p)).unwrap();
            }
            assert!(s.start().is_some());
            Self { s, switches: 0 }
        }

        /// Run a thread-context call, then dispatch if it made one due.
        fn thread<R>(&mut self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
            assert!(!self.s.in_isr());
            let r = f(&mut self.s);
            if self.s.dispatch_pending() {
                self.switch();
            }
            r
        }

        /// Run `f` as an interrupt handler body.
        fn interrupt<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
            self.s.isr_enter();
            let r = f(self);
            if self.s.isr_exit() {
                self.switch();
            }
            r
        }

        fn switch(&mut self) {
            let outgoing = self.s.current().map_or(SavedContext::NONE, ctx);
            let next = self.s.switch_context(outgoing);
            assert_eq!(Some(next), self.s.current().map(ctx));
            self.switches += 1;
        }

        fn tick(&mut self) {
            self.interrupt(|h| h.s.tick());
        }

        fn running(&self) -> Option<Priority> {
            self.s.current()
        }

        /// The dispatch rule, checked outside interrupt context.
        fn assert_priority_invariant(&self) {
            assert_eq!(self.s.current(), self.s.ready_set().find_set());
            if let Some(p) = self.s.current() {
                assert_eq!(self.s.thread_state(p), Some(ThreadState::Ready));
            }
        }
    }

    // --- thread lifecycle ---------------------------------------------------

    #[test]
    fn first_dispatch_picks_most_urgent() {
        let h = Harness::with_threads(&[9, 4, 12]);
        assert_eq!(h.running(), Some(4));
        h.assert_priority_invariant();
    }

    #[test]
    fn duplicate_priority_is_rejected() {
        let mut h = Harness::with_threads(&[3]);
        let mut built = false;
        let r = h.thread(|s| {
            s.create_thread(3, || {
                built = true;
                ctx(3)
            })
        });
        assert_eq!(r, Err(KernelError::PriorityExists));
        assert!(!built, "stack frame must not be built for a rejected thread");
        assert_eq!(h.s.live_threads(), 2);
    }

    #[test]
    fn priority_out_of_range_is_invalid() {
        let mut h = Harness::with_threads(&[]);
        assert_eq!(
            h.thread(|s| s.create_thread(LOWEST_PRIORITY + 1, || ctx(0))),
            Err(KernelError::PriorityInvalid)
        );
        // Reserved for the idle thread, whether or not it exists yet
        assert_eq!(
            h.thread(|s| s.create_thread(LOWEST_PRIORITY, || ctx(0))),
            Err(KernelError::PriorityInvalid)
        );
        let mut s = Scheduler::new();
        assert_eq!(
            s.create_thread(LOWEST_PRIORITY, || ctx(0)),
            Err(KernelError::PriorityInvalid)
        );
        assert_eq!(s.thread_state(LOWEST_PRIORITY), Some(ThreadState::Dormant));
    }

    #[test]
    fn table_full() {
        let user: Vec<Priority> = (0..MAX_USER_THREADS as Priority).collect();
        let mut h = Harness::with_threads(&user);
        assert_eq!(h.s.live_threads(), MAX_THREADS);
        assert_eq!(
            h.thread(|s| s.create_thread(20, || ctx(20))),
            Err(KernelError::NoMoreSlots)
        );
    }

    #[test]
    fn create_from_isr_is_rejected() {
        let mut h = Harness::with_threads(&[5]);
        let r = h.interrupt(|h| h.s.create_thread(2, || ctx(2)));
        assert_eq!(r, Err(KernelError::WrongContext));
        assert_eq!(h.s.thread_state(2), Some(ThreadState::Dormant));
    }

    #[test]
    fn creating_a_more_urgent_thread_preempts() {
        let mut h = Harness::with_threads(&[6]);
        h.thread(|s| s.create_thread(1, || ctx(1))).unwrap();
        assert_eq!(h.running(), Some(1));
        h.thread(|s| s.create_thread(4, || ctx(4))).unwrap();
        assert_eq!(h.running(), Some(1));
        h.assert_priority_invariant();
    }

    #[test]
    fn delete_self_switches_to_next_ready() {
        let mut h = Harness::with_threads(&[2, 7, 9]);
        assert_eq!(h.running(), Some(2));
        let switches = h.switches;

        let r = h.thread(|s| s.delete_thread(ThreadRef::Current));
        assert_eq!(r, Ok(Deleted::Current));
        assert_eq!(h.switches, switches + 1);
        assert_eq!(h.running(), Some(7));
        assert_eq!(h.s.thread_state(2), Some(ThreadState::Dormant));
        h.assert_priority_invariant();
    }

    #[test]
    fn delete_by_own_priority_is_self_delete() {
        let mut h = Harness::with_threads(&[3, 8]);
        assert_eq!(h.thread(|s| s.delete_thread(ThreadRef::Priority(3))), Ok(Deleted::Current));
        assert_eq!(h.running(), Some(8));
    }

    #[test]
    fn delete_errors() {
        let mut h = Harness::with_threads(&[3]);
        assert_eq!(
            h.thread(|s| s.delete_thread(LOWEST_PRIORITY.into())),
            Err(KernelError::ThreadDeleteIdle)
        );
        assert_eq!(
            h.thread(|s| s.delete_thread(ThreadRef::Priority(10))),
            Err(KernelError::ThreadNotFound)
        );
        assert_eq!(
            h.thread(|s| s.delete_thread(ThreadRef::Priority(200))),
            Err(KernelError::PriorityInvalid)
        );
        assert_eq!(
            h.interrupt(|h| h.s.delete_thread(ThreadRef::Priority(3))),
            Err(KernelError::ThreadDeleteIsr)
        );
        assert_eq!(h.s.thread_state(3), Some(ThreadState::Ready));
    }

    #[test]
    fn delete_blocked_thread_leaves_wait_list() {
        let mut h = Harness::with_threads(&[1, 4]);
        let sem = h.s.semaphore_create(0).unwrap();
        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 0)), Ok(WaitOutcome::Blocked));
        assert_eq!(h.running(), Some(4));

        assert_eq!(h.thread(|s| s.delete_thread(ThreadRef::Priority(1))), Ok(Deleted::Other));
        assert!(h.s.waiters(sem).unwrap().is_empty());

        // The signal now has nobody to wake
        h.thread(|s| s.semaphore_signal(sem)).unwrap();
        assert_eq!(h.s.semaphore_count(sem), Ok(1));
    }

    #[test]
    fn deleted_priority_can_be_recreated() {
        let mut h = Harness::with_threads(&[5, 6]);
        h.thread(|s| s.delete_thread(ThreadRef::Priority(6))).unwrap();
        h.thread(|s| s.create_thread(6, || ctx(6))).unwrap();
        assert_eq!(h.s.thread_state(6), Some(ThreadState::Ready));
        assert_eq!(h.s.live_threads(), 3);
    }

    // --- semaphores ----------------------------------------------------------

    #[test]
    fn wait_with_units_available_does_not_block() {
        let mut h = Harness::with_threads(&[2]);
        let sem = h.s.semaphore_create(2).unwrap();
        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 0)), Ok(WaitOutcome::Acquired));
        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 0)), Ok(WaitOutcome::Acquired));
        assert_eq!(h.s.semaphore_count(sem), Ok(0));
        assert_eq!(h.switches, 0);

        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 0)), Ok(WaitOutcome::Blocked));
        assert_eq!(h.s.semaphore_count(sem), Ok(0));
        assert_eq!(h.running(), Some(LOWEST_PRIORITY));
    }

    #[test]
    fn signal_from_lower_priority_wakes_waiter() {
        // Threads 2 and 5 share a semaphore with an initial count of 0
        let mut h = Harness::with_threads(&[2, 5]);
        let sem = h.s.semaphore_create(0).unwrap();

        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 0)), Ok(WaitOutcome::Blocked));
        assert_eq!(h.running(), Some(5));

        h.thread(|s| s.semaphore_signal(sem)).unwrap();
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.thread(|s| s.wait_result()), Ok(()));
        assert_eq!(h.s.semaphore_count(sem), Ok(0));
        h.assert_priority_invariant();
    }

    #[test]
    fn signal_wakes_most_urgent_waiter_first() {
        let mut h = Harness::with_threads(&[3, 6, 10]);
        let sem = h.s.semaphore_create(0).unwrap();

        // 3 and 6 block in turn; 10 runs
        h.thread(|s| s.semaphore_wait(sem, 0)).unwrap();
        h.thread(|s| s.semaphore_wait(sem, 0)).unwrap();
        assert_eq!(h.running(), Some(10));

        h.thread(|s| s.semaphore_signal(sem)).unwrap();
        assert_eq!(h.running(), Some(3));
        assert_eq!(h.s.thread_state(6), Some(ThreadState::BlockedOnSemaphore));
    }

    #[test]
    fn signal_overflow_leaves_count() {
        let mut h = Harness::with_threads(&[4]);
        let sem = h.s.semaphore_create(u32::MAX - 2).unwrap();
        assert_eq!(h.thread(|s| s.semaphore_signal(sem)), Ok(()));
        assert_eq!(h.thread(|s| s.semaphore_signal(sem)), Ok(()));
        assert_eq!(
            h.thread(|s| s.semaphore_signal(sem)),
            Err(KernelError::SemaphoreOverflow)
        );
        assert_eq!(h.s.semaphore_count(sem), Ok(u32::MAX));
    }

    #[test]
    fn semaphore_pool_exhaustion_returns_none() {
        let mut s = Scheduler::new();
        for _ in 0..MAX_SEMAPHORES {
            assert!(s.semaphore_create(0).is_some());
        }
        assert_eq!(s.semaphore_create(0), None);
    }

    #[test]
    fn wait_outside_thread_context_is_rejected() {
        let mut s = Scheduler::new();
        let sem = s.semaphore_create(0).unwrap();
        // Not started: no calling thread
        assert_eq!(s.semaphore_wait(sem, 0), Err(KernelError::WrongContext));

        let mut h = Harness::with_threads(&[1]);
        let sem = h.s.semaphore_create(0).unwrap();
        assert_eq!(
            h.interrupt(|h| h.s.semaphore_wait(sem, 0)),
            Err(KernelError::WrongContext)
        );
        assert_eq!(h.running(), Some(1));
    }

    #[test]
    fn wait_times_out_after_exact_ticks() {
        let mut h = Harness::with_threads(&[2, 5]);
        let sem = h.s.semaphore_create(0).unwrap();
        assert_eq!(h.thread(|s| s.semaphore_wait(sem, 10)), Ok(WaitOutcome::Blocked));

        for _ in 0..9 {
            h.tick();
            assert_eq!(h.running(), Some(5));
        }
        h.tick();
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.thread(|s| s.wait_result()), Err(KernelError::Timeout));
        assert!(h.s.waiters(sem).unwrap().is_empty());

        // A late signal counts up instead of waking anyone
        h.thread(|s| s.semaphore_signal(sem)).unwrap();
        assert_eq!(h.s.semaphore_count(sem), Ok(1));
    }

    #[test]
    fn longest_timeout_is_not_cut_short() {
        let mut h = Harness::with_threads(&[2, 5]);
        let sem = h.s.semaphore_create(0).unwrap();
        assert_eq!(h.thread(|s| s.semaphore_wait(sem, u32::MAX)), Ok(WaitOutcome::Blocked));
        for _ in 0..1000 {
            h.tick();
            assert_eq!(h.s.thread_state(2), Some(ThreadState::BlockedOnSemaphore));
        }
        h.thread(|s| s.semaphore_signal(sem)).unwrap();
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.thread(|s| s.wait_result()), Ok(()));
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let mut h = Harness::with_threads(&[2]);
        let sem = h.s.semaphore_create(0).unwrap();
        h.thread(|s| s.semaphore_wait(sem, 0)).unwrap();
        for _ in 0..10_000 {
            h.tick();
        }
        assert_eq!(h.s.thread_state(2), Some(ThreadState::BlockedOnSemaphore));
    }

    #[test]
    fn signal_and_timeout_on_same_tick_wake_once() {
        // Timeout handled first: the signal finds no waiter
        let mut h = Harness::with_threads(&[2, 5]);
        let sem = h.s.semaphore_create(0).unwrap();
        h.thread(|s| s.semaphore_wait(sem, 3)).unwrap();
        let switches = h.switches;
        h.interrupt(|h| {
            h.s.tick();
            h.s.tick();
            h.s.tick();
            h.s.semaphore_signal(sem).unwrap();
        });
        assert_eq!(h.switches, switches + 1);
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.thread(|s| s.wait_result()), Err(KernelError::Timeout));
        assert_eq!(h.s.semaphore_count(sem), Ok(1));

        // Signal handled first: the expiry finds the thread ready
        let mut h = Harness::with_threads(&[2, 5]);
        let sem = h.s.semaphore_create(0).unwrap();
        h.thread(|s| s.semaphore_wait(sem, 3)).unwrap();
        h.tick();
        h.tick();
        let switches = h.switches;
        h.interrupt(|h| {
            h.s.semaphore_signal(sem).unwrap();
            h.s.tick();
        });
        assert_eq!(h.switches, switches + 1);
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.thread(|s| s.wait_result()), Ok(()));
        assert_eq!(h.s.semaphore_count(sem), Ok(0));
    }

    // --- delays ----------------------------------------------------------------

    #[test]
    fn zero_delay_does_not_dispatch() {
        let mut h = Harness::with_threads(&[2, 5]);
        assert_eq!(h.thread(|s| s.time_delay(0)), Ok(false));
        assert_eq!(h.switches, 0);
        assert_eq!(h.running(), Some(2));
    }

    #[test]
    fn delay_expires_exactly() {
        let mut h = Harness::with_threads(&[2, 5]);
        h.s.time_set(u32::MAX - 1);
        assert_eq!(h.thread(|s| s.time_delay(4)), Ok(true));
        assert_eq!(h.running(), Some(5));
        for _ in 0..3 {
            h.tick();
            assert_eq!(h.s.thread_state(2), Some(ThreadState::Delayed));
        }
        h.tick();
        assert_eq!(h.s.time_get(), 2);
        assert_eq!(h.running(), Some(2));
        h.assert_priority_invariant();
    }

    #[test]
    fn long_delay_is_not_cut_short() {
        let mut h = Harness::with_threads(&[2, 5]);
        assert_eq!(h.thread(|s| s.time_delay(3_000_000_000)), Ok(true));
        for _ in 0..1000 {
            h.tick();
            assert_eq!(h.s.thread_state(2), Some(ThreadState::Delayed));
        }
        assert_eq!(h.running(), Some(5));
    }

    #[test]
    fn time_set_does_not_move_pending_delays() {
        let mut h = Harness::with_threads(&[2, 5]);
        h.thread(|s| s.time_delay(5)).unwrap();
        h.tick();
        h.thread(|s| s.time_set(1_000_000));
        for _ in 0..3 {
            h.tick();
            assert_eq!(h.s.thread_state(2), Some(ThreadState::Delayed));
        }
        h.tick();
        assert_eq!(h.running(), Some(2));
        assert_eq!(h.s.time_get(), 1_000_004);
    }

    #[test]
    fn delay_from_isr_is_rejected() {
        let mut h = Harness::with_threads(&[2]);
        assert_eq!(h.interrupt(|h| h.s.time_delay(5)), Err(KernelError::WrongContext));
        assert_eq!(h.s.thread_state(2), Some(ThreadState::Ready));
    }

    // --- interrupts ------------------------------------------------------------

    #[test]
    fn nested_isr_defers_dispatch_to_outermost_exit() {
        let mut h = Harness::with_threads(&[1, 6]);
        let sem = h.s.semaphore_create(0).unwrap();
        h.thread(|s| s.semaphore_wait(sem, 0)).unwrap();
        assert_eq!(h.running(), Some(6));

        h.s.isr_enter();
        h.s.isr_enter();
        assert_eq!(h.s.isr_depth(), 2);
        h.s.semaphore_signal(sem).unwrap();
        assert!(h.s.needs_reschedule());
        assert!(!h.s.dispatch_pending());

        assert!(!h.s.isr_exit(), "inner exit must not dispatch");
        assert_eq!(h.running(), Some(6));
        assert!(h.s.isr_exit(), "outermost exit dispatches");
        h.switch();
        assert_eq!(h.running(), Some(1));
    }

    #[test]
    fn isr_exit_without_new_work_resumes_interrupted_thread() {
        let mut h = Harness::with_threads(&[3]);
        let switches = h.switches;
        h.tick();
        assert_eq!(h.switches, switches);
        assert_eq!(h.running(), Some(3));
    }

    #[test]
    fn unmatched_isr_exit_is_ignored() {
        let mut s = Scheduler::new();
        s.create_idle_thread(|| ctx(LOWEST_PRIORITY)).unwrap();
        s.create_thread(6, || ctx(6)).unwrap();
        s.start().unwrap();
        // Readied without a dispatch, so a reschedule is due
        s.create_thread(2, || ctx(2)).unwrap();
        assert!(s.needs_reschedule());

        assert!(!s.isr_exit());
        assert_eq!(s.isr_depth(), 0);
        assert_eq!(s.current(), Some(6));
    }

    #[test]
    fn switch_context_saves_outgoing_stack_pointer() {
        let mut s = Scheduler::new();
        s.create_idle_thread(|| ctx(LOWEST_PRIORITY)).unwrap();
        s.create_thread(4, || ctx(4)).unwrap();
        assert_eq!(s.start(), Some(ctx(4)));

        s.time_delay(1).unwrap();
        let saved = SavedContext::from_stack_pointer(0x2000_1234 as *mut u32);
        assert_eq!(s.switch_context(saved), ctx(LOWEST_PRIORITY));

        s.isr_enter();
        s.tick();
        assert!(s.isr_exit());
        assert_eq!(s.switch_context(ctx(LOWEST_PRIORITY)), saved);
    }

    #[test]
    fn start_without_threads() {
        let mut s = Scheduler::new();
        assert_eq!(s.start(), None);
        assert!(!s.is_started());
    }

    // --- properties --------------------------------------------------------------

    /// A kernel call, decoded from random bytes.
    #[derive(Debug)]
    enum Op {
        Create(Priority),
        Delete(Priority),
        DeleteSelf,
        Wait(usize, Ticks),
        Signal(usize),
        SignalFromIsr(usize),
        Delay(Ticks),
        Tick,
    }

    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Op> + '_ {
        bytecode.chunks_exact(3).map(|instr| {
            let prio = instr[1] % (LOWEST_PRIORITY + 1);
            let sem = instr[1] as usize % 3;
            let ticks = (instr[2] % 8) as Ticks;
            match instr[0] % 8 {
                0 => Op::Create(prio),
                1 => Op::Delete(prio),
                2 => Op::DeleteSelf,
                3 => Op::Wait(sem, ticks),
                4 => Op::Signal(sem),
                5 => Op::SignalFromIsr(sem),
                6 => Op::Delay(ticks),
                _ => Op::Tick,
            }
        })
    }

    #[quickcheck]
    fn random_operations_keep_invariants(bytecode: Vec<u8>) {
        let mut h = Harness::with_threads(&[4, 9, 17]);
        let sems: Vec<SemaphoreId> = (0..3).map(|i| h.s.semaphore_create(i).unwrap()).collect();

        for op in interpret(&bytecode) {
            log::trace!("    {op:?}");
            let before = h.running();
            match op {
                Op::Create(p) => {
                    let _ = h.thread(|s| s.create_thread(p, || ctx(p)));
                }
                Op::Delete(p) => {
                    let _ = h.thread(|s| s.delete_thread(p.into()));
                }
                Op::DeleteSelf => {
                    let r = h.thread(|s| s.delete_thread(ThreadRef::Current));
                    if r.is_ok() {
                        assert_ne!(h.running(), before, "deleted thread kept running");
                    }
                }
                Op::Wait(i, timeout) => {
                    if before == Some(LOWEST_PRIORITY) {
                        // The idle thread never waits
                        continue;
                    }
                    let count = h.s.semaphore_count(sems[i]).unwrap();
                    match h.thread(|s| s.semaphore_wait(sems[i], timeout)) {
                        Ok(WaitOutcome::Acquired) => {
                            assert_eq!(h.s.semaphore_count(sems[i]).unwrap(), count - 1)
                        }
                        Ok(WaitOutcome::Blocked) => {
                            assert_eq!(count, 0);
                            assert_ne!(h.running(), before);
                        }
                        Err(e) => panic!("unexpected {e:?}"),
                    }
                }
                Op::Signal(i) => {
                    h.thread(|s| s.semaphore_signal(sems[i])).unwrap();
                }
                Op::SignalFromIsr(i) => {
                    h.interrupt(|h| h.s.semaphore_signal(sems[i])).unwrap();
                }
                Op::Delay(ticks) => {
                    if before == Some(LOWEST_PRIORITY) && ticks != 0 {
                        continue;
                    }
                    h.thread(|s| s.time_delay(ticks)).unwrap();
                    if ticks == 0 {
                        assert_eq!(h.running(), before);
                    }
                }
                Op::Tick => h.tick(),
            }

            h.assert_priority_invariant();
            assert_eq!(h.s.thread_state(LOWEST_PRIORITY), Some(ThreadState::Ready));
            for &sem in &sems {
                let waiters = h.s.waiters(sem).unwrap();
                // Units are never left idle while someone waits
                assert!(waiters.is_empty() || h.s.semaphore_count(sem).unwrap() == 0);
                for p in waiters.iter() {
                    assert_eq!(h.s.thread_state(p), Some(ThreadState::BlockedOnSemaphore));
                }
            }
        }
    }
}
