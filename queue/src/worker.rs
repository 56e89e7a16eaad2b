//! Per-shard worker: drain, transcode, send.
//!
//! One worker task per shard drains that shard's hand-off, transcodes each
//! batch into a reusable wire buffer and pushes it through the backoff
//! sender. The flush timer covers the partial-batch case; the hard-shutdown
//! signal is the only path that abandons buffered data.

use crate::backoff::{send_with_backoff, SendAttempt};
use crate::batch::BatchQueue;
use crate::manager::QueueCore;
use crate::metrics::REASON_TOO_OLD;
use crate::request;
use crate::shards::ShardStats;
use crate::timestamp::{unix_now, unix_now_ms};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use virta_core::{
    DataPoint, PointKind, SendError, WireExemplar, WireHistogram, WireHistogramValue, WireSample,
    WireSeries,
};

/// Points transcoded into the wire buffer, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PendingCounts {
    pub samples: usize,
    pub exemplars: usize,
    pub histograms: usize,
}

impl PendingCounts {
    pub(crate) fn total(&self) -> usize {
        self.samples + self.exemplars + self.histograms
    }
}

enum Event {
    HardShutdown,
    Batch(Vec<DataPoint>),
    Closed,
    Timer,
}

pub(crate) async fn run_shard(
    core: Arc<QueueCore>,
    shard_id: usize,
    queue: Arc<BatchQueue>,
    mut rx: mpsc::Receiver<Vec<DataPoint>>,
    mut hard_shutdown: watch::Receiver<bool>,
    stats: Arc<ShardStats>,
) {
    let mut max = core.cfg.max_samples_per_send;
    if core.cfg.send_exemplars {
        max += max / 10;
    }
    let mut pending: Vec<WireSeries> = vec![WireSeries::default(); max];

    let deadline = tokio::time::sleep(core.cfg.batch_send_deadline);
    tokio::pin!(deadline);

    loop {
        let event = {
            let mut cancel = hard_shutdown.clone();
            tokio::select! {
                _ = cancel.wait_for(|stop| *stop) => Event::HardShutdown,
                maybe = rx.recv() => match maybe {
                    Some(batch) => Event::Batch(batch),
                    None => Event::Closed,
                },
                _ = &mut deadline => Event::Timer,
            }
        };

        match event {
            Event::HardShutdown => {
                drop_residual(&core, &stats);
                break;
            }
            Event::Batch(batch) => {
                let counts = populate_wire_series(&batch, &mut pending);
                queue.return_for_reuse(batch);
                let n = counts.total();
                send_batch(&core, &stats, &mut hard_shutdown, &mut pending[..n], counts).await;
                deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + core.cfg.batch_send_deadline);
            }
            Event::Closed => break,
            Event::Timer => {
                let batch = queue.batch(&mut rx);
                if !batch.is_empty() {
                    let counts = populate_wire_series(&batch, &mut pending);
                    debug!(
                        shard = shard_id,
                        samples = counts.samples,
                        exemplars = counts.exemplars,
                        histograms = counts.histograms,
                        "flush deadline reached, sending buffered data"
                    );
                    let n = counts.total();
                    send_batch(&core, &stats, &mut hard_shutdown, &mut pending[..n], counts)
                        .await;
                }
                queue.return_for_reuse(batch);
                deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + core.cfg.batch_send_deadline);
            }
        }
    }

    if stats.running.fetch_sub(1, Ordering::AcqRel) == 1 {
        let _ = stats.done.send(true);
    }
}

/// Account everything still enqueued on this generation as failed and
/// dropped. The counters are swapped to zero so racing workers claim the
/// residual exactly once.
fn drop_residual(core: &QueueCore, stats: &ShardStats) {
    let samples = stats.enqueued_samples.swap(0, Ordering::AcqRel).max(0);
    let exemplars = stats.enqueued_exemplars.swap(0, Ordering::AcqRel).max(0);
    let histograms = stats.enqueued_histograms.swap(0, Ordering::AcqRel).max(0);

    core.metrics.pending_samples.sub(samples);
    core.metrics.pending_exemplars.sub(exemplars);
    core.metrics.pending_histograms.sub(histograms);
    core.metrics.failed_samples_total.inc_by(samples as u64);
    core.metrics.failed_exemplars_total.inc_by(exemplars as u64);
    core.metrics.failed_histograms_total.inc_by(histograms as u64);

    stats
        .samples_dropped_on_hard_shutdown
        .fetch_add(samples as u64, Ordering::Relaxed);
    stats
        .exemplars_dropped_on_hard_shutdown
        .fetch_add(exemplars as u64, Ordering::Relaxed);
    stats
        .histograms_dropped_on_hard_shutdown
        .fetch_add(histograms as u64, Ordering::Relaxed);
}

/// Copy the batch into the wire buffer, clearing each reused slot first.
///
/// Returns per-kind counts; the populated prefix of `pending` has exactly
/// `counts.total()` slots.
pub(crate) fn populate_wire_series(
    batch: &[DataPoint],
    pending: &mut [WireSeries],
) -> PendingCounts {
    let mut counts = PendingCounts::default();
    let mut n = 0;

    for point in batch {
        let slot = &mut pending[n];
        slot.clear();
        slot.labels = point.series_labels.clone();

        match point.kind {
            PointKind::Sample => {
                slot.samples.push(WireSample {
                    value: point.value,
                    timestamp: point.timestamp,
                });
                counts.samples += 1;
            }
            PointKind::Exemplar => {
                slot.exemplars.push(WireExemplar {
                    labels: point.exemplar_labels.clone(),
                    value: point.value,
                    timestamp: point.timestamp,
                });
                counts.exemplars += 1;
            }
            PointKind::Histogram => {
                let Some(histogram) = &point.histogram else {
                    continue;
                };
                slot.histograms.push(WireHistogram {
                    timestamp: point.timestamp,
                    value: WireHistogramValue::Int(histogram.clone()),
                });
                counts.histograms += 1;
            }
            PointKind::FloatHistogram => {
                let Some(histogram) = &point.float_histogram else {
                    continue;
                };
                slot.histograms.push(WireHistogram {
                    timestamp: point.timestamp,
                    value: WireHistogramValue::Float(histogram.clone()),
                });
                counts.histograms += 1;
            }
        }
        n += 1;
    }

    counts
}

/// Send one transcoded batch and settle its accounting.
///
/// The rescaling meters, the last-send stamp and the pending/enqueued
/// counters move regardless of the outcome - a failed batch is not retried,
/// so it can no longer be pending. Failure additionally feeds the
/// `failed_*` counters.
async fn send_batch(
    core: &QueueCore,
    stats: &ShardStats,
    shutdown: &mut watch::Receiver<bool>,
    series: &mut [WireSeries],
    counts: PendingCounts,
) {
    let begin = tokio::time::Instant::now();
    let result = send_series_with_backoff(core, shutdown, series, counts).await;

    if let Err(err) = result {
        error!(
            samples = counts.samples,
            exemplars = counts.exemplars,
            histograms = counts.histograms,
            error = %err,
            "non-recoverable error while sending batch"
        );
        core.metrics.failed_samples_total.inc_by(counts.samples as u64);
        core.metrics
            .failed_exemplars_total
            .inc_by(counts.exemplars as u64);
        core.metrics
            .failed_histograms_total
            .inc_by(counts.histograms as u64);
    }

    core.data_out.incr(counts.total() as i64);
    core.data_out_duration.incr(begin.elapsed().as_nanos() as i64);
    core.last_send_timestamp.store(unix_now(), Ordering::Relaxed);

    core.metrics.pending_samples.sub(counts.samples as i64);
    core.metrics
        .pending_exemplars
        .sub(counts.exemplars as i64);
    core.metrics
        .pending_histograms
        .sub(counts.histograms as i64);
    stats
        .enqueued_samples
        .fetch_sub(counts.samples as i64, Ordering::Relaxed);
    stats
        .enqueued_exemplars
        .fetch_sub(counts.exemplars as i64, Ordering::Relaxed);
    stats
        .enqueued_histograms
        .fetch_sub(counts.histograms as i64, Ordering::Relaxed);
}

async fn send_series_with_backoff(
    core: &QueueCore,
    shutdown: &mut watch::Receiver<bool>,
    series: &mut [WireSeries],
    counts: PendingCounts,
) -> Result<(), SendError> {
    let (built, _) = request::build_request(core.encoder.as_ref(), &mut *series, &[], None)
        .map_err(|e| SendError::Fatal(e.to_string()))?;
    core.build_request_limit_timestamp
        .store(built.lowest_timestamp, Ordering::Relaxed);

    let highest = built.highest_timestamp;
    let request_size = built.payload.len();

    let mut attempt = BatchAttempt {
        core,
        series,
        counts,
        payload: built.payload,
    };
    let result = send_with_backoff(&core.cfg, shutdown, &mut attempt).await;

    if matches!(result, Err(SendError::Canceled)) {
        // A reshard or hard shutdown cut the send short: nothing landed, so
        // neither the byte counter nor the highest-sent stamp may move.
        return result;
    }

    core.metrics.sent_bytes_total.inc_by(request_size as u64);
    core.metrics
        .highest_sent_timestamp
        .set_if_greater(highest as f64 / 1000.0);
    result
}

/// One batch's hooks into the retry loop.
struct BatchAttempt<'a> {
    core: &'a QueueCore,
    series: &'a mut [WireSeries],
    counts: PendingCounts,
    payload: Bytes,
}

#[async_trait]
impl SendAttempt for BatchAttempt<'_> {
    async fn attempt(&mut self, try_index: usize) -> Result<(), SendError> {
        let age_limit = self.core.cfg.sample_age_limit;
        let now_ms = unix_now_ms();
        let lowest = self
            .core
            .build_request_limit_timestamp
            .load(Ordering::Relaxed);
        if request::is_sample_old(now_ms, age_limit, lowest) {
            // The batch has been waiting long enough that part of it aged
            // out; rebuild the request without the stale series.
            let filter = request::too_old_filter(now_ms, age_limit);
            let series = std::mem::take(&mut self.series);
            let (built, dropped) = request::build_request(
                self.core.encoder.as_ref(),
                &mut *series,
                &[],
                Some(&filter),
            )
            .map_err(|e| SendError::Fatal(e.to_string()))?;
            self.core
                .build_request_limit_timestamp
                .store(built.lowest_timestamp, Ordering::Relaxed);
            self.core
                .metrics
                .dropped_samples_total
                .with_label_values(&[REASON_TOO_OLD])
                .inc_by(dropped.samples as u64);
            self.core
                .metrics
                .dropped_exemplars_total
                .with_label_values(&[REASON_TOO_OLD])
                .inc_by(dropped.exemplars as u64);
            self.core
                .metrics
                .dropped_histograms_total
                .with_label_values(&[REASON_TOO_OLD])
                .inc_by(dropped.histograms as u64);
            self.payload = built.payload;
            self.series = &mut series[..built.kept];
        }

        self.core
            .metrics
            .samples_total
            .inc_by(self.counts.samples as u64);
        self.core
            .metrics
            .exemplars_total
            .inc_by(self.counts.exemplars as u64);
        self.core
            .metrics
            .histograms_total
            .inc_by(self.counts.histograms as u64);

        let client = self.core.client();
        let begin = tokio::time::Instant::now();
        let result = client.store(self.payload.clone(), try_index).await;
        self.core
            .metrics
            .sent_batch_duration
            .observe(begin.elapsed().as_secs_f64());
        result
    }

    fn on_retry(&mut self) {
        self.core
            .metrics
            .retried_samples_total
            .inc_by(self.counts.samples as u64);
        self.core
            .metrics
            .retried_exemplars_total
            .inc_by(self.counts.exemplars as u64);
        self.core
            .metrics
            .retried_histograms_total
            .inc_by(self.counts.histograms as u64);
    }
}
