//! Provides `PrioBitmap`, a one-word set of priorities with a constant-time
//! "most urgent member" query.
//!
//! Bit `i` stands for priority `i`. Priority 0 is the most urgent, so the
//! most urgent member is the lowest set bit, found with a single
//! count-trailing-zeros (`rbit` + `clz` on Thumb-2).
use core::fmt;

use crate::config::PRIORITY_LEVELS;
use crate::thread::Priority;

const _: () = assert!(PRIORITY_LEVELS <= u32::BITS as usize);

/// A set of priorities. Used both as the ready indicator and as the wait
/// list of each semaphore.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u32,
}

impl PrioBitmap {
    pub const EMPTY: Self = Self { bits: 0 };

    /// Get the bit for the specified priority.
    ///
    /// Panics if `prio` is out of range.
    #[inline]
    pub fn get(&self, prio: Priority) -> bool {
        self.bits & Self::mask(prio) != 0
    }

    /// Set the bit for the specified priority.
    #[inline]
    pub fn set(&mut self, prio: Priority) {
        self.bits |= Self::mask(prio);
    }

    /// Clear the bit for the specified priority.
    #[inline]
    pub fn clear(&mut self, prio: Priority) {
        self.bits &= !Self::mask(prio);
    }

    /// Get the most urgent (numerically smallest) priority in the set.
    #[inline]
    pub fn find_set(&self) -> Option<Priority> {
        if self.bits == 0 {
            None
        } else {
            Some(self.bits.trailing_zeros() as Priority)
        }
    }

    /// Remove and return the most urgent priority in the set.
    #[inline]
    pub fn pop(&mut self) -> Option<Priority> {
        let prio = self.find_set()?;
        self.clear(prio);
        Some(prio)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Iterate over the members, most urgent first.
    pub fn iter(&self) -> impl Iterator<Item = Priority> {
        let mut rest = *self;
        core::iter::from_fn(move || rest.pop())
    }

    #[inline]
    fn mask(prio: Priority) -> u32 {
        assert!((prio as usize) < PRIORITY_LEVELS);
        1 << prio
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
