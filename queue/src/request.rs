//! Outgoing request assembly.
//!
//! The worker's wire buffer is compacted through an optional drop filter,
//! the extreme timestamps of the surviving series are computed, and the
//! bytes are produced by the embedder's encoder. Compaction swaps kept
//! slots forward so their relative order - and every allocation - survives.

use bytes::Bytes;
use tracing::debug;
use virta_core::{EncodeError, MetricMetadata, RequestEncoder, WireSeries};

/// A request ready for the wire, with the timestamp range it covers.
pub(crate) struct BuiltRequest {
    pub payload: Bytes,
    /// Highest timestamp (ms) across the encoded series; 0 when empty.
    pub highest_timestamp: i64,
    /// Lowest timestamp (ms) across the encoded series; `i64::MAX` when
    /// empty.
    pub lowest_timestamp: i64,
    /// Series that survived the filter; they occupy the front of the input
    /// slice.
    pub kept: usize,
}

/// Series removed by the drop filter, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DroppedCounts {
    pub samples: usize,
    pub exemplars: usize,
    pub histograms: usize,
}

impl DroppedCounts {
    pub(crate) fn total(&self) -> usize {
        self.samples + self.exemplars + self.histograms
    }
}

/// Build one request from the populated prefix of a wire buffer.
///
/// `filter` returns true for series to drop. The kept prefix is passed to
/// the encoder; dropped counts are handed back for the caller's meters.
pub(crate) fn build_request(
    encoder: &dyn RequestEncoder,
    series: &mut [WireSeries],
    metadata: &[MetricMetadata],
    filter: Option<&dyn Fn(&WireSeries) -> bool>,
) -> Result<(BuiltRequest, DroppedCounts), EncodeError> {
    let (kept, highest, lowest, dropped) = compact_series(series, filter);
    if dropped.total() > 0 {
        debug!(
            samples = dropped.samples,
            exemplars = dropped.exemplars,
            histograms = dropped.histograms,
            "dropped data due to age"
        );
    }

    let kept_len = kept.len();
    let payload = encoder.encode(kept, metadata)?;
    Ok((
        BuiltRequest {
            payload,
            highest_timestamp: highest,
            lowest_timestamp: lowest,
            kept: kept_len,
        },
        dropped,
    ))
}

/// Move kept series to the front of the slice, preserving their order, and
/// report the timestamp extremes of what survived.
fn compact_series<'a>(
    series: &'a mut [WireSeries],
    filter: Option<&dyn Fn(&WireSeries) -> bool>,
) -> (&'a [WireSeries], i64, i64, DroppedCounts) {
    let mut highest = 0i64;
    let mut lowest = i64::MAX;
    let mut dropped = DroppedCounts::default();
    let mut keep = 0;

    for i in 0..series.len() {
        if let Some(filter) = filter {
            if filter(&series[i]) {
                if !series[i].samples.is_empty() {
                    dropped.samples += 1;
                }
                if !series[i].exemplars.is_empty() {
                    dropped.exemplars += 1;
                }
                if !series[i].histograms.is_empty() {
                    dropped.histograms += 1;
                }
                continue;
            }
        }

        // Each slot carries a single observation of one kind.
        for ts in series[i]
            .samples
            .first()
            .map(|s| s.timestamp)
            .into_iter()
            .chain(series[i].exemplars.first().map(|e| e.timestamp))
            .chain(series[i].histograms.first().map(|h| h.timestamp))
        {
            highest = highest.max(ts);
            lowest = lowest.min(ts);
        }

        series.swap(keep, i);
        keep += 1;
    }

    (&series[..keep], highest, lowest, dropped)
}

/// True when `timestamp_ms` has aged past `age_limit` relative to `now_ms`.
/// A zero limit disables the check.
pub(crate) fn is_sample_old(now_ms: i64, age_limit: std::time::Duration, timestamp_ms: i64) -> bool {
    if age_limit.is_zero() {
        return false;
    }
    timestamp_ms < now_ms - age_limit.as_millis() as i64
}

/// Drop filter for series whose single observation is too old.
pub(crate) fn too_old_filter(
    now_ms: i64,
    age_limit: std::time::Duration,
) -> impl Fn(&WireSeries) -> bool {
    move |series: &WireSeries| {
        let timestamp = series
            .samples
            .first()
            .map(|s| s.timestamp)
            .or_else(|| series.exemplars.first().map(|e| e.timestamp))
            .or_else(|| series.histograms.first().map(|h| h.timestamp));
        timestamp.is_some_and(|ts| is_sample_old(now_ms, age_limit, ts))
    }
}
