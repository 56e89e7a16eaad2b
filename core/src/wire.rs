//! Wire-form series and the request-encoder contract.
//!
//! A shard worker transcodes its batch of [`DataPoint`]s into a reusable
//! buffer of [`WireSeries`] slots, then hands the populated prefix to a
//! [`RequestEncoder`] which turns it into one opaque request payload.
//! Serialization format and framing compression both live behind the trait.
//!
//! [`DataPoint`]: crate::point::DataPoint

use crate::error::EncodeError;
use crate::labels::Labels;
use crate::point::{FloatHistogram, Histogram, MetricMetadata};
use bytes::Bytes;

/// One sample in wire form.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WireSample {
    /// Observed value.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// One exemplar in wire form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireExemplar {
    /// Trace labels attached to the exemplar.
    pub labels: Labels,
    /// Observed value.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Histogram payload of a wire-form histogram observation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireHistogramValue {
    /// Integer bucket counts.
    Int(Histogram),
    /// Floating-point bucket counts.
    Float(FloatHistogram),
}

/// One native-histogram observation in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct WireHistogram {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The histogram payload.
    pub value: WireHistogramValue,
}

/// A reusable transcoding slot: one series with its observations.
///
/// Slots are allocated once per shard worker and recycled between sends;
/// [`clear`](WireSeries::clear) resets the sub-slices without freeing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireSeries {
    /// Identity of the series.
    pub labels: Labels,
    /// Samples for this series.
    pub samples: Vec<WireSample>,
    /// Exemplars for this series.
    pub exemplars: Vec<WireExemplar>,
    /// Native histograms for this series.
    pub histograms: Vec<WireHistogram>,
}

impl WireSeries {
    /// Reset the slot for reuse, keeping allocations.
    pub fn clear(&mut self) {
        self.labels.clear();
        self.samples.clear();
        self.exemplars.clear();
        self.histograms.clear();
    }
}

/// Serialize-and-compress step for one outgoing request.
///
/// Implementations are free in format and compression; the queue only
/// requires that encoding the same input is deterministic enough for the
/// remote to deduplicate retries. Encode failures are non-recoverable: the
/// batch is dropped and counted as failed.
pub trait RequestEncoder: Send + Sync {
    /// Encode the given series and metadata into one request payload.
    ///
    /// Either slice may be empty; metadata-only requests are how per-metric
    /// metadata travels.
    fn encode(
        &self,
        series: &[WireSeries],
        metadata: &[MetricMetadata],
    ) -> Result<Bytes, EncodeError>;
}
