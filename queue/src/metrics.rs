//! Prometheus meters for one remote-write queue.
//!
//! Each queue manager owns a full set of meters labeled with the remote's
//! name and endpoint, registered on `start` and unregistered on `stop` so a
//! reconfigured endpoint never leaks stale series into the registry.

use crate::timestamp::MaxTimestamp;
use prometheus::core::Collector;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::collections::HashMap;

const NAMESPACE: &str = "virta";
const SUBSYSTEM: &str = "remote_write";

/// Drop reason: the point aged past `sample_age_limit` before a retry.
pub const REASON_TOO_OLD: &str = "too_old";
/// Drop reason: the series was intentionally dropped upstream.
pub const REASON_DROPPED_SERIES: &str = "dropped_series";
/// Drop reason: the series vanished upstream without being marked dropped.
pub const REASON_UNINTENTIONAL_DROPPED_SERIES: &str = "unintentionally_dropped_series";

/// All meters of one queue, const-labeled by remote name and endpoint.
pub(crate) struct QueueMetrics {
    pub samples_total: IntCounter,
    pub exemplars_total: IntCounter,
    pub histograms_total: IntCounter,
    pub metadata_total: IntCounter,

    pub failed_samples_total: IntCounter,
    pub failed_exemplars_total: IntCounter,
    pub failed_histograms_total: IntCounter,
    pub failed_metadata_total: IntCounter,

    pub retried_samples_total: IntCounter,
    pub retried_exemplars_total: IntCounter,
    pub retried_histograms_total: IntCounter,
    pub retried_metadata_total: IntCounter,

    pub dropped_samples_total: IntCounterVec,
    pub dropped_exemplars_total: IntCounterVec,
    pub dropped_histograms_total: IntCounterVec,

    pub enqueue_retries_total: IntCounter,
    pub sent_batch_duration: Histogram,
    pub highest_sent_timestamp: MaxTimestamp,

    pub pending_samples: IntGauge,
    pub pending_exemplars: IntGauge,
    pub pending_histograms: IntGauge,

    pub shard_capacity: IntGauge,
    pub num_shards: IntGauge,
    pub max_num_shards: IntGauge,
    pub min_num_shards: IntGauge,
    pub desired_num_shards: Gauge,

    pub sent_bytes_total: IntCounter,
    pub metadata_bytes_total: IntCounter,
    pub max_samples_per_send: IntGauge,
}

fn opts(name: &str, help: &str, const_labels: &HashMap<String, String>) -> Opts {
    Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .const_labels(const_labels.clone())
}

fn counter(
    name: &str,
    help: &str,
    const_labels: &HashMap<String, String>,
) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(opts(name, help, const_labels))
}

fn counter_vec(
    name: &str,
    help: &str,
    const_labels: &HashMap<String, String>,
) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(opts(name, help, const_labels), &["reason"])
}

fn int_gauge(
    name: &str,
    help: &str,
    const_labels: &HashMap<String, String>,
) -> prometheus::Result<IntGauge> {
    IntGauge::with_opts(opts(name, help, const_labels))
}

impl QueueMetrics {
    pub(crate) fn new(remote_name: &str, endpoint: &str) -> prometheus::Result<Self> {
        let labels: HashMap<String, String> = [
            ("remote_name".to_string(), remote_name.to_string()),
            ("url".to_string(), endpoint.to_string()),
        ]
        .into_iter()
        .collect();

        let buckets: Vec<f64> = prometheus::DEFAULT_BUCKETS
            .iter()
            .copied()
            .chain([25.0, 60.0, 120.0, 300.0])
            .collect();

        Ok(Self {
            samples_total: counter(
                "samples_total",
                "Total number of samples sent to remote storage.",
                &labels,
            )?,
            exemplars_total: counter(
                "exemplars_total",
                "Total number of exemplars sent to remote storage.",
                &labels,
            )?,
            histograms_total: counter(
                "histograms_total",
                "Total number of histograms sent to remote storage.",
                &labels,
            )?,
            metadata_total: counter(
                "metadata_total",
                "Total number of metadata entries sent to remote storage.",
                &labels,
            )?,
            failed_samples_total: counter(
                "samples_failed_total",
                "Total number of samples which failed on send to remote storage, \
                 non-recoverable errors.",
                &labels,
            )?,
            failed_exemplars_total: counter(
                "exemplars_failed_total",
                "Total number of exemplars which failed on send to remote storage, \
                 non-recoverable errors.",
                &labels,
            )?,
            failed_histograms_total: counter(
                "histograms_failed_total",
                "Total number of histograms which failed on send to remote storage, \
                 non-recoverable errors.",
                &labels,
            )?,
            failed_metadata_total: counter(
                "metadata_failed_total",
                "Total number of metadata entries which failed on send to remote \
                 storage, non-recoverable errors.",
                &labels,
            )?,
            retried_samples_total: counter(
                "samples_retried_total",
                "Total number of samples which were retried because the send error \
                 was recoverable.",
                &labels,
            )?,
            retried_exemplars_total: counter(
                "exemplars_retried_total",
                "Total number of exemplars which were retried because the send error \
                 was recoverable.",
                &labels,
            )?,
            retried_histograms_total: counter(
                "histograms_retried_total",
                "Total number of histograms which were retried because the send error \
                 was recoverable.",
                &labels,
            )?,
            retried_metadata_total: counter(
                "metadata_retried_total",
                "Total number of metadata entries which were retried because the send \
                 error was recoverable.",
                &labels,
            )?,
            dropped_samples_total: counter_vec(
                "samples_dropped_total",
                "Total number of samples dropped before send, by reason.",
                &labels,
            )?,
            dropped_exemplars_total: counter_vec(
                "exemplars_dropped_total",
                "Total number of exemplars dropped before send, by reason.",
                &labels,
            )?,
            dropped_histograms_total: counter_vec(
                "histograms_dropped_total",
                "Total number of histograms dropped before send, by reason.",
                &labels,
            )?,
            enqueue_retries_total: counter(
                "enqueue_retries_total",
                "Total number of times enqueue has failed because a shard's queue was \
                 full.",
                &labels,
            )?,
            sent_batch_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "sent_batch_duration_seconds",
                    "Duration of send calls to the remote storage.",
                )
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .const_labels(labels.clone())
                .buckets(buckets),
            )?,
            highest_sent_timestamp: MaxTimestamp::new(Gauge::with_opts(opts(
                "queue_highest_sent_timestamp_seconds",
                "Highest timestamp successfully sent by this queue, in seconds since \
                 epoch.",
                &labels,
            ))?),
            pending_samples: int_gauge(
                "samples_pending",
                "The number of samples pending in the queue's shards to be sent.",
                &labels,
            )?,
            pending_exemplars: int_gauge(
                "exemplars_pending",
                "The number of exemplars pending in the queue's shards to be sent.",
                &labels,
            )?,
            pending_histograms: int_gauge(
                "histograms_pending",
                "The number of histograms pending in the queue's shards to be sent.",
                &labels,
            )?,
            shard_capacity: int_gauge(
                "shard_capacity",
                "The capacity of each shard of the queue.",
                &labels,
            )?,
            num_shards: int_gauge(
                "shards",
                "The number of shards used for parallel sending to the remote storage.",
                &labels,
            )?,
            max_num_shards: int_gauge(
                "shards_max",
                "The maximum number of shards the queue is allowed to run.",
                &labels,
            )?,
            min_num_shards: int_gauge(
                "shards_min",
                "The minimum number of shards the queue is allowed to run.",
                &labels,
            )?,
            desired_num_shards: Gauge::with_opts(opts(
                "shards_desired",
                "The number of shards the rescaler wants to run, based on the rate of \
                 samples in vs. samples out.",
                &labels,
            ))?,
            sent_bytes_total: counter(
                "bytes_total",
                "The total number of bytes of data (not metadata) sent by the queue \
                 after compression.",
                &labels,
            )?,
            metadata_bytes_total: counter(
                "metadata_bytes_total",
                "The total number of bytes of metadata sent by the queue after \
                 compression.",
                &labels,
            )?,
            max_samples_per_send: int_gauge(
                "max_samples_per_send",
                "The maximum number of samples sent in a single request to the remote \
                 storage.",
                &labels,
            )?,
        })
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.samples_total.clone()),
            Box::new(self.exemplars_total.clone()),
            Box::new(self.histograms_total.clone()),
            Box::new(self.metadata_total.clone()),
            Box::new(self.failed_samples_total.clone()),
            Box::new(self.failed_exemplars_total.clone()),
            Box::new(self.failed_histograms_total.clone()),
            Box::new(self.failed_metadata_total.clone()),
            Box::new(self.retried_samples_total.clone()),
            Box::new(self.retried_exemplars_total.clone()),
            Box::new(self.retried_histograms_total.clone()),
            Box::new(self.retried_metadata_total.clone()),
            Box::new(self.dropped_samples_total.clone()),
            Box::new(self.dropped_exemplars_total.clone()),
            Box::new(self.dropped_histograms_total.clone()),
            Box::new(self.enqueue_retries_total.clone()),
            Box::new(self.sent_batch_duration.clone()),
            Box::new(self.highest_sent_timestamp.gauge().clone()),
            Box::new(self.pending_samples.clone()),
            Box::new(self.pending_exemplars.clone()),
            Box::new(self.pending_histograms.clone()),
            Box::new(self.shard_capacity.clone()),
            Box::new(self.num_shards.clone()),
            Box::new(self.max_num_shards.clone()),
            Box::new(self.min_num_shards.clone()),
            Box::new(self.desired_num_shards.clone()),
            Box::new(self.sent_bytes_total.clone()),
            Box::new(self.metadata_bytes_total.clone()),
            Box::new(self.max_samples_per_send.clone()),
        ]
    }

    pub(crate) fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for collector in self.collectors() {
            registry.register(collector)?;
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, registry: &Registry) {
        for collector in self.collectors() {
            let _ = registry.unregister(collector);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trip() {
        let metrics = QueueMetrics::new("primary", "http://remote:9090/api/v1/write").unwrap();
        let registry = Registry::new();

        metrics.register(&registry).unwrap();
        let families = registry.gather();
        assert!(!families.is_empty());
        assert!(families
            .iter()
            .any(|f| f.get_name() == "virta_remote_write_samples_total"));

        // Registering again on the same registry collides.
        assert!(metrics.register(&registry).is_err());

        metrics.unregister(&registry);
        assert!(registry.gather().is_empty());

        // A fresh cycle works after unregistration.
        metrics.register(&registry).unwrap();
        metrics.unregister(&registry);
    }

    #[test]
    fn const_labels_carry_identity() {
        let metrics = QueueMetrics::new("primary", "http://remote/api").unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        let families = registry.gather();
        let samples = families
            .iter()
            .find(|f| f.get_name() == "virta_remote_write_samples_total")
            .unwrap();
        let labels = samples.get_metric()[0].get_label();
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "remote_name" && l.get_value() == "primary"));
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "url" && l.get_value() == "http://remote/api"));
    }

    #[test]
    fn dropped_counters_accept_reasons() {
        let metrics = QueueMetrics::new("n", "e").unwrap();
        metrics
            .dropped_samples_total
            .with_label_values(&[REASON_TOO_OLD])
            .inc_by(3);
        assert_eq!(
            metrics
                .dropped_samples_total
                .with_label_values(&[REASON_TOO_OLD])
                .get(),
            3
        );
    }
}
