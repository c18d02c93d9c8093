//! # Semaphores
//!
//! Event control blocks (ECBs) backing the kernel's counting semaphores,
//! and the fixed pool they are allocated from. ECBs are never freed; a
//! handle stays valid for the lifetime of the system.
//!
//! The wait list of an ECB is a priority bitmap, so the most urgent waiter
//! is always the one woken and insertion is priority-ordered by
//! construction.

use crate::config::MAX_SEMAPHORES;
use crate::error::KernelError;
use crate::prio_bitmap::PrioBitmap;
use crate::thread::Priority;

/// Handle to a semaphore, returned by `semaphore_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(u8);

impl SemaphoreId {
    pub(crate) const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Index of the ECB in the pool.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Rebuild a handle passed through a thread argument.
    ///
    /// Values that never came from [`usize::from`] yield a handle every
    /// semaphore call rejects with `SemaphoreInvalid`.
    pub fn from_raw(raw: usize) -> Self {
        Self(u8::try_from(raw).unwrap_or(u8::MAX))
    }
}

impl From<SemaphoreId> for usize {
    fn from(id: SemaphoreId) -> usize {
        id.index()
    }
}

/// Event Control Block: a semaphore count plus the threads waiting on it.
///
/// Invariant: `count > 0` implies the wait list is empty. A signal hands
/// its unit straight to a waiter when there is one.
#[derive(Debug, Clone, Copy)]
pub struct EventControlBlock {
    pub count: u32,
    pub wait_list: PrioBitmap,
}

impl EventControlBlock {
    pub const EMPTY: Self = Self {
        count: 0,
        wait_list: PrioBitmap::EMPTY,
    };

    /// Take one unit if available.
    #[inline]
    pub fn try_take(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Return one unit to the count. Fails without modifying the count if
    /// it is already at its maximum.
    #[inline]
    pub fn give(&mut self) -> Result<(), KernelError> {
        self.count = self
            .count
            .checked_add(1)
            .ok_or(KernelError::SemaphoreOverflow)?;
        Ok(())
    }

    #[inline]
    pub fn enqueue(&mut self, prio: Priority) {
        self.wait_list.set(prio);
    }

    /// Remove and return the most urgent waiter.
    #[inline]
    pub fn dequeue(&mut self) -> Option<Priority> {
        self.wait_list.pop()
    }

    /// Drop `prio` from the wait list, e.g. when its timeout expires.
    #[inline]
    pub fn remove(&mut self, prio: Priority) {
        self.wait_list.clear(prio);
    }
}

/// Fixed-size pool of ECBs with bump allocation.
#[derive(Debug)]
pub struct SemaphorePool {
    ecbs: [EventControlBlock; MAX_SEMAPHORES],
    allocated: usize,
}

impl SemaphorePool {
    pub const fn new() -> Self {
        Self {
            ecbs: [EventControlBlock::EMPTY; MAX_SEMAPHORES],
            allocated: 0,
        }
    }

    /// Allocate an ECB with the given initial count. Returns `None` when
    /// the pool is exhausted.
    pub fn create(&mut self, initial_count: u32) -> Option<SemaphoreId> {
        if self.allocated >= MAX_SEMAPHORES {
            return None;
        }
        let id = SemaphoreId::new(self.allocated as u8);
        self.ecbs[id.index()] = EventControlBlock {
            count: initial_count,
            wait_list: PrioBitmap::EMPTY,
        };
        self.allocated += 1;
        Some(id)
    }

    pub fn get(&self, id: SemaphoreId) -> Result<&EventControlBlock, KernelError> {
        self.ecbs[..self.allocated]
            .get(id.index())
            .ok_or(KernelError::SemaphoreInvalid)
    }

    pub fn get_mut(&mut self, id: SemaphoreId) -> Result<&mut EventControlBlock, KernelError> {
        self.ecbs[..self.allocated]
            .get_mut(id.index())
            .ok_or(KernelError::SemaphoreInvalid)
    }

    /// Number of ECBs handed out so far.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl Default for SemaphorePool {
    fn default() -> Self {
        Self::new()
    }
}
