//! Tick-based EWMA rate meter.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Exponentially weighted moving rate of a monotonic event counter.
///
/// `incr` runs concurrently on the hot path; `tick` is called at a fixed
/// cadence by the control loop that owns the meter. Each tick folds the
/// events observed since the previous tick into the rate:
///
/// ```text
/// rate ← weight · (delta / interval) + (1 − weight) · rate
/// ```
///
/// The rate starts at zero and, with non-negative increments, never goes
/// below it. Ticking with no new events decays the rate geometrically.
pub struct EwmaRate {
    pending: AtomicI64,
    rate: Mutex<f64>,
    weight: f64,
    interval: Duration,
}

impl EwmaRate {
    /// Create a meter with smoothing `weight` in `(0, 1)` and the tick
    /// `interval` the caller commits to.
    pub fn new(weight: f64, interval: Duration) -> Self {
        Self {
            pending: AtomicI64::new(0),
            rate: Mutex::new(0.0),
            weight,
            interval,
        }
    }

    /// Record `n` events since the last tick.
    pub fn incr(&self, n: i64) {
        self.pending.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the events observed since the last tick into the rate.
    pub fn tick(&self) {
        let delta = self.pending.swap(0, Ordering::Relaxed);
        let instant_rate = delta as f64 / self.interval.as_secs_f64();

        let mut rate = self.rate.lock();
        *rate = self.weight * instant_rate + (1.0 - self.weight) * *rate;
    }

    /// The rate computed by the most recent tick, in events per second.
    pub fn rate(&self) -> f64 {
        *self.rate.lock()
    }
}
