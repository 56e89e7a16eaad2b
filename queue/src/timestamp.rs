//! Monotonic-max timestamp gauges and wall-clock helpers.

use parking_lot::Mutex;
use prometheus::Gauge;
use std::time::{SystemTime, UNIX_EPOCH};

/// A gauge that only moves forward.
///
/// Tracks the highest timestamp (seconds since the Unix epoch) observed so
/// far and mirrors it into a prometheus gauge. Used for the highest sent
/// and highest received timestamps, whose difference is the delivery delay
/// the rescaler works against.
pub struct MaxTimestamp {
    max: Mutex<f64>,
    gauge: Gauge,
}

impl MaxTimestamp {
    /// Wrap a gauge. The fold starts at zero.
    pub fn new(gauge: Gauge) -> Self {
        Self {
            max: Mutex::new(0.0),
            gauge,
        }
    }

    /// Raise the recorded maximum to `seconds` if it is higher.
    pub fn set_if_greater(&self, seconds: f64) {
        let mut max = self.max.lock();
        if seconds > *max {
            *max = seconds;
            self.gauge.set(seconds);
        }
    }

    /// The highest value recorded so far.
    pub fn get(&self) -> f64 {
        *self.max.lock()
    }

    /// The backing gauge, for registration.
    pub fn gauge(&self) -> &Gauge {
        &self.gauge
    }
}

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gauge() -> Gauge {
        Gauge::new("test_max_timestamp_seconds", "test").unwrap()
    }

    #[test]
    fn only_moves_forward() {
        let ts = MaxTimestamp::new(gauge());
        ts.set_if_greater(5.0);
        assert_eq!(ts.get(), 5.0);
        assert_eq!(ts.gauge().get(), 5.0);

        ts.set_if_greater(3.0);
        assert_eq!(ts.get(), 5.0);
        assert_eq!(ts.gauge().get(), 5.0);

        ts.set_if_greater(8.5);
        assert_eq!(ts.get(), 8.5);
        assert_eq!(ts.gauge().get(), 8.5);
    }
}
