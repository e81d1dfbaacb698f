//! Clocks for TESSERA.
//!
//! All scheduling arithmetic happens in microseconds as `f64`, the unit
//! performance models and the bus model predict in. Scheduler code reads
//! time through the [`Clock`] trait so that simulations and tests can drive
//! it by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of the current time in microseconds
pub trait Clock: Send + Sync {
    /// Current time in microseconds since an arbitrary fixed origin
    fn now_us(&self) -> f64;
}

/// Wall-clock time measured from the clock's creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000_000.0
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero
    #[must_use]
    pub fn new() -> Self {
        Self::at(0.0)
    }

    /// Create a clock at the given time
    #[must_use]
    pub fn at(now_us: f64) -> Self {
        Self {
            bits: AtomicU64::new(now_us.to_bits()),
        }
    }

    /// Set the current time
    pub fn set(&self, now_us: f64) {
        self.bits.store(now_us.to_bits(), Ordering::Release);
    }

    /// Advance by a number of microseconds
    pub fn advance(&self, delta_us: f64) {
        let now = self.now_us();
        self.set(now + delta_us);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
