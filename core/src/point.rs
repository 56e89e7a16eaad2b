//! Data points and metric metadata.
//!
//! [`DataPoint`] is the single envelope type flowing from the producer into
//! the queue: a tagged record where exactly one payload field is populated
//! for the given [`PointKind`]. The constructors uphold that invariant.

use crate::labels::Labels;

/// Which payload a [`DataPoint`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    /// A plain numeric observation.
    Sample,
    /// A trace-linked sample carrying extra labels.
    Exemplar,
    /// A sparse native histogram with integer bucket counts.
    Histogram,
    /// A sparse native histogram with floating-point bucket counts.
    FloatHistogram,
}

/// A run of consecutive buckets in a sparse histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketSpan {
    /// Gap to the previous span (or the starting offset for the first span).
    pub offset: i32,
    /// Number of consecutive buckets covered by this span.
    pub length: u32,
}

/// A sparse native histogram observation with integer counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    /// Total number of observations.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Bucket resolution exponent; bucket boundaries grow by `2^(2^-schema)`.
    pub schema: i32,
    /// Width of the zero bucket around the origin.
    pub zero_threshold: f64,
    /// Observations inside the zero bucket.
    pub zero_count: u64,
    /// Spans of populated positive buckets.
    pub positive_spans: Vec<BucketSpan>,
    /// Delta-encoded counts for the positive buckets.
    pub positive_deltas: Vec<i64>,
    /// Spans of populated negative buckets.
    pub negative_spans: Vec<BucketSpan>,
    /// Delta-encoded counts for the negative buckets.
    pub negative_deltas: Vec<i64>,
}

/// A sparse native histogram observation with floating-point counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatHistogram {
    /// Total number of observations.
    pub count: f64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Bucket resolution exponent.
    pub schema: i32,
    /// Width of the zero bucket around the origin.
    pub zero_threshold: f64,
    /// Observations inside the zero bucket.
    pub zero_count: f64,
    /// Spans of populated positive buckets.
    pub positive_spans: Vec<BucketSpan>,
    /// Absolute counts for the positive buckets.
    pub positive_counts: Vec<f64>,
    /// Spans of populated negative buckets.
    pub negative_spans: Vec<BucketSpan>,
    /// Absolute counts for the negative buckets.
    pub negative_counts: Vec<f64>,
}

/// One observation bound for the remote endpoint.
///
/// `series_labels` is the routing key: all points of one series land on the
/// same shard and are delivered in enqueue order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Which payload field is populated.
    pub kind: PointKind,
    /// Identity of the series; sorted, unique names.
    pub series_labels: Labels,
    /// Observed value (samples and exemplars).
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Extra labels carried by an exemplar; empty otherwise.
    pub exemplar_labels: Labels,
    /// Integer-bucket histogram payload.
    pub histogram: Option<Histogram>,
    /// Float-bucket histogram payload.
    pub float_histogram: Option<FloatHistogram>,
}

impl DataPoint {
    /// A plain sample.
    pub fn sample(series_labels: Labels, value: f64, timestamp: i64) -> Self {
        Self {
            kind: PointKind::Sample,
            series_labels,
            value,
            timestamp,
            exemplar_labels: Labels::default(),
            histogram: None,
            float_histogram: None,
        }
    }

    /// An exemplar with its trace labels.
    pub fn exemplar(
        series_labels: Labels,
        exemplar_labels: Labels,
        value: f64,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: PointKind::Exemplar,
            series_labels,
            value,
            timestamp,
            exemplar_labels,
            histogram: None,
            float_histogram: None,
        }
    }

    /// An integer-bucket native histogram.
    pub fn histogram(series_labels: Labels, histogram: Histogram, timestamp: i64) -> Self {
        Self {
            kind: PointKind::Histogram,
            series_labels,
            value: 0.0,
            timestamp,
            exemplar_labels: Labels::default(),
            histogram: Some(histogram),
            float_histogram: None,
        }
    }

    /// A float-bucket native histogram.
    pub fn float_histogram(
        series_labels: Labels,
        float_histogram: FloatHistogram,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: PointKind::FloatHistogram,
            series_labels,
            value: 0.0,
            timestamp,
            exemplar_labels: Labels::default(),
            histogram: None,
            float_histogram: Some(float_histogram),
        }
    }
}

/// Kind of a metric family, as reported in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    /// Monotonically increasing counter.
    Counter,
    /// Value that can go up and down.
    Gauge,
    /// Classic histogram family.
    Histogram,
    /// Gauge histogram family.
    GaugeHistogram,
    /// Summary with quantiles.
    Summary,
    /// Info metric.
    Info,
    /// State set.
    StateSet,
    /// Untyped or unrecognized.
    Unknown,
}

/// Per-metric-family metadata shipped out of band from the samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMetadata {
    /// Name of the metric family this entry describes.
    pub metric_family_name: String,
    /// Declared kind of the family.
    pub kind: MetadataKind,
    /// Help text.
    pub help: String,
    /// Unit, when declared.
    pub unit: String,
}
