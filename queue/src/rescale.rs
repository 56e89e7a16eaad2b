//! Adaptive shard rescaling.
//!
//! The desired shard count is derived from four EWMA signals: how fast data
//! arrives, how fast it leaves, how much of it survives relabelling, and
//! how long sends take. Hysteresis keeps the count from oscillating: small
//! deviations are ignored, a queue that is far behind never sheds shards,
//! and a stalling remote suppresses resharding entirely (handled by the
//! caller's stall check).

use std::time::Duration;
use tracing::debug;

/// Smoothing weight shared by the rescaling meters.
pub(crate) const EWMA_WEIGHT: f64 = 0.2;

/// Cadence of the rescaling control loop; also the meters' tick interval.
pub(crate) const SHARD_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Allow 30% too many shards before scaling down.
pub(crate) const SHARD_TOLERANCE_FRACTION: f64 = 0.3;

/// Catch up on 5% of the backlog per second when behind.
const BACKLOG_CATCHUP_FRACTION: f64 = 0.05;

/// Do not downshard while more than this many seconds behind.
const MAX_DELAY_FOR_DOWNSHARD_SECS: f64 = 10.0;

/// Rates and timestamps feeding one rescaling decision.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateSnapshot {
    /// Arrival rate, points per second.
    pub data_in: f64,
    /// Send rate, points per second.
    pub data_out: f64,
    /// Upstream drop rate, points per second.
    pub data_dropped: f64,
    /// Seconds spent sending per second.
    pub send_seconds: f64,
    /// Highest timestamp delivered, seconds since epoch.
    pub highest_sent: f64,
    /// Highest timestamp received, seconds since epoch.
    pub highest_recv: f64,
}

/// Outcome of one rescaling calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ShardCalculation {
    /// The shard count to run; equals `current` when nothing should change.
    pub target: usize,
    /// The raw, unclamped desired count, for the gauge. `None` when there
    /// was no send signal this tick.
    pub raw_desired: Option<f64>,
}

/// Compute the shard count the queue should be running.
pub(crate) fn calculate_desired_shards(
    snapshot: &RateSnapshot,
    current: usize,
    min_shards: usize,
    max_shards: usize,
) -> ShardCalculation {
    let data_kept_ratio = snapshot.data_out / (snapshot.data_dropped + snapshot.data_out);
    let delay = snapshot.highest_recv - snapshot.highest_sent;
    let data_pending = delay * snapshot.data_in * data_kept_ratio;

    if snapshot.data_out <= 0.0 {
        // No batch left the queue this window; there is no signal to scale
        // on.
        return ShardCalculation {
            target: current,
            raw_desired: None,
        };
    }

    let backlog_catchup = BACKLOG_CATCHUP_FRACTION * data_pending;
    let time_per_sample = snapshot.send_seconds / snapshot.data_out;
    let raw = time_per_sample * (snapshot.data_in * data_kept_ratio + backlog_catchup);

    debug!(
        data_in = snapshot.data_in,
        data_out = snapshot.data_out,
        data_kept_ratio,
        data_pending,
        send_seconds = snapshot.send_seconds,
        time_per_sample,
        desired = raw,
        highest_sent = snapshot.highest_sent,
        highest_recv = snapshot.highest_recv,
        "calculated desired shards"
    );

    let lower = current as f64 * (1.0 - SHARD_TOLERANCE_FRACTION);
    let upper = current as f64 * (1.0 + SHARD_TOLERANCE_FRACTION);
    let desired = raw.ceil();
    if lower <= desired && desired <= upper {
        return ShardCalculation {
            target: current,
            raw_desired: Some(raw),
        };
    }

    let desired = desired as usize;
    if desired < current && delay > MAX_DELAY_FOR_DOWNSHARD_SECS {
        debug!("not downsharding due to being too far behind");
        return ShardCalculation {
            target: current,
            raw_desired: Some(raw),
        };
    }

    ShardCalculation {
        target: desired.clamp(min_shards, max_shards),
        raw_desired: Some(raw),
    }
}
