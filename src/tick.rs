//! # Tick Arithmetic
//!
//! The system clock is a 32-bit tick counter that wraps on overflow.
//! Delays and timeouts are not compared against the clock: each one counts
//! its own ticks down, so every length from 1 to `u32::MAX` expires on
//! exactly its last tick and `time_set` never moves a pending expiry.

use crate::config::HEARTBEAT_PERIOD_TICKS;

/// Absolute time, in ticks since power-up or the last `time_set`.
pub type Ticks = u32;

/// Ticks left until a delay or semaphore timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    remaining: Ticks,
}

impl Countdown {
    /// A countdown of `ticks` ticks. `None` for 0, which means "no limit"
    /// to a semaphore wait and "no delay" to `time_delay`.
    #[inline]
    pub const fn new(ticks: Ticks) -> Option<Self> {
        if ticks == 0 {
            None
        } else {
            Some(Self { remaining: ticks })
        }
    }

    /// Account for one tick. Returns `true` on the tick that expires it.
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    #[inline]
    pub const fn remaining(&self) -> Ticks {
        self.remaining
    }
}

/// Something the tick handler blinks to show the kernel is alive, such as
/// a board LED.
pub trait Heartbeat: Sync {
    fn toggle(&self);
}

/// Divides the tick rate down to the heartbeat period.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatDivider {
    remaining: u32,
}

impl HeartbeatDivider {
    pub const fn new() -> Self {
        Self {
            remaining: HEARTBEAT_PERIOD_TICKS,
        }
    }

    /// Account for one tick. Returns `true` when the heartbeat should
    /// toggle.
    pub fn tick(&mut self) -> bool {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.remaining = HEARTBEAT_PERIOD_TICKS;
            true
        } else {
            false
        }
    }
}

impl Default for HeartbeatDivider {
    fn default() -> Self {
        Self::new()
    }
}
