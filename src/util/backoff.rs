//! Bounded spin/yield backoff used before a true thread suspension.
//!
//! Every blocking primitive in this crate spins briefly before parking.
//! The spin phase is bounded: once [`Backoff::is_exhausted`] reports true
//! the caller must either park or give up, so no primitive can busy-wait
//! indefinitely.

use std::hint;
use std::thread;

use crate::config::SpinConfig;

/// Exponential spin/yield backoff with a hard bound.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    spin_limit: u32,
    yield_limit: u32,
}

impl Backoff {
    /// Creates a backoff with the given tuning.
    #[must_use]
    pub const fn new(config: &SpinConfig) -> Self {
        Self {
            step: 0,
            spin_limit: config.spin_limit,
            yield_limit: config.yield_limit,
        }
    }

    /// Backs off once: processor hints while below the spin limit, a
    /// scheduler yield afterwards. Each spin round doubles in length.
    pub fn snooze(&mut self) {
        if self.step <= self.spin_limit {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= self.yield_limit {
            self.step += 1;
        }
    }

    /// True once the spin and yield phases are both used up; the caller
    /// should now park (or abandon the wait).
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.step > self.yield_limit
    }

    /// Restarts the backoff from the cheap end.
    pub fn reset(&mut self) {
        self.step = 0;
    }
}
