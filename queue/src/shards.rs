//! The shard set: routing, lifecycle and two-phase shutdown.
//!
//! A generation of shards is born on `start` and torn down as a whole on
//! `stop`; reshard is stop-then-start with a different count, which is what
//! preserves per-shard ordering across a resize. Producers take the shared
//! side of the lock, structural changes take the exclusive side.

use crate::batch::BatchQueue;
use crate::manager::QueueCore;
use crate::worker;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::error;
use virta_core::{DataPoint, PointKind};

pub(crate) struct ShardSet {
    core: Arc<QueueCore>,
    active: RwLock<Option<Active>>,
}

/// One running generation of shards.
struct Active {
    queues: Vec<Arc<BatchQueue>>,
    stats: Arc<ShardStats>,
    /// Blocks new enqueues; fired first on stop.
    soft_shutdown: watch::Sender<bool>,
    /// Cancels in-flight sends; fired when the flush deadline runs out.
    hard_shutdown: watch::Sender<bool>,
    /// Fired by the last worker to exit.
    done: watch::Receiver<bool>,
}

/// Counters scoped to one shard generation, for shutdown loss accounting.
pub(crate) struct ShardStats {
    pub(crate) running: AtomicUsize,
    pub(crate) done: watch::Sender<bool>,

    pub(crate) enqueued_samples: AtomicI64,
    pub(crate) enqueued_exemplars: AtomicI64,
    pub(crate) enqueued_histograms: AtomicI64,

    pub(crate) samples_dropped_on_hard_shutdown: AtomicU64,
    pub(crate) exemplars_dropped_on_hard_shutdown: AtomicU64,
    pub(crate) histograms_dropped_on_hard_shutdown: AtomicU64,
}

impl ShardSet {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Self {
            core,
            active: RwLock::new(None),
        }
    }

    /// Launch `n` shards. Any previous generation must have been stopped.
    pub(crate) async fn start(&self, n: usize) {
        let mut active = self.active.write().await;

        self.core.metrics.pending_samples.set(0);
        self.core.metrics.pending_exemplars.set(0);
        self.core.metrics.pending_histograms.set(0);
        self.core.metrics.num_shards.set(n as i64);

        let (soft_tx, _) = watch::channel(false);
        let (hard_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let stats = Arc::new(ShardStats {
            running: AtomicUsize::new(n),
            done: done_tx,
            enqueued_samples: AtomicI64::new(0),
            enqueued_exemplars: AtomicI64::new(0),
            enqueued_histograms: AtomicI64::new(0),
            samples_dropped_on_hard_shutdown: AtomicU64::new(0),
            exemplars_dropped_on_hard_shutdown: AtomicU64::new(0),
            histograms_dropped_on_hard_shutdown: AtomicU64::new(0),
        });

        let mut queues = Vec::with_capacity(n);
        for shard_id in 0..n {
            let (queue, rx) = BatchQueue::new(
                self.core.cfg.max_samples_per_send,
                self.core.cfg.capacity,
            );
            let queue = Arc::new(queue);
            queues.push(Arc::clone(&queue));
            tokio::spawn(worker::run_shard(
                Arc::clone(&self.core),
                shard_id,
                queue,
                rx,
                hard_tx.subscribe(),
                Arc::clone(&stats),
            ));
        }

        *active = Some(Active {
            queues,
            stats,
            soft_shutdown: soft_tx,
            hard_shutdown: hard_tx,
            done: done_rx,
        });
    }

    /// Route one point to its shard.
    ///
    /// Hands the point back when the target shard is full or a shutdown or
    /// reshard is in progress; the producer backs off and retries.
    pub(crate) async fn enqueue(&self, point: DataPoint) -> Result<(), DataPoint> {
        let active = self.active.read().await;
        let Some(active) = active.as_ref() else {
            return Err(point);
        };
        if *active.soft_shutdown.borrow() {
            return Err(point);
        }

        let shard = (point.series_labels.shard_hash() % active.queues.len() as u64) as usize;
        let kind = point.kind;
        active.queues[shard].append(point)?;

        match kind {
            PointKind::Sample => {
                self.core.metrics.pending_samples.inc();
                active.stats.enqueued_samples.fetch_add(1, Ordering::Relaxed);
            }
            PointKind::Exemplar => {
                self.core.metrics.pending_exemplars.inc();
                active
                    .stats
                    .enqueued_exemplars
                    .fetch_add(1, Ordering::Relaxed);
            }
            PointKind::Histogram | PointKind::FloatHistogram => {
                self.core.metrics.pending_histograms.inc();
                active
                    .stats
                    .enqueued_histograms
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Two-phase shutdown.
    ///
    /// Soft first: enqueues start failing, every queue flushes its partial
    /// batch asynchronously, and the workers get `flush_deadline` to drain.
    /// Past the deadline the hard signal cancels in-flight sends; whatever
    /// was still buffered is counted and dropped.
    pub(crate) async fn stop(&self) {
        {
            let active = self.active.read().await;
            let Some(active) = active.as_ref() else {
                return;
            };
            let _ = active.soft_shutdown.send(true);
        }

        // The exclusive lock is held for the whole drain so a concurrent
        // start cannot interleave with a generation that is still dying.
        let mut guard = self.active.write().await;
        let Some(active) = guard.take() else {
            return;
        };

        for queue in &active.queues {
            let queue = Arc::clone(queue);
            let done = active.done.clone();
            tokio::spawn(async move { queue.flush_and_shutdown(done).await });
        }

        let mut done = active.done.clone();
        let drained = tokio::time::timeout(self.core.cfg.flush_deadline, async {
            let _ = done.wait_for(|d| *d).await;
        })
        .await
        .is_ok();

        if !drained {
            let _ = active.hard_shutdown.send(true);
            let _ = done.wait_for(|d| *d).await;
        }

        let stats = &active.stats;
        let dropped = stats.samples_dropped_on_hard_shutdown.load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all samples on shutdown");
        }
        let dropped = stats
            .exemplars_dropped_on_hard_shutdown
            .load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all exemplars on shutdown");
        }
        let dropped = stats
            .histograms_dropped_on_hard_shutdown
            .load(Ordering::Relaxed);
        if dropped > 0 {
            error!(count = dropped, "failed to flush all histograms on shutdown");
        }
    }
}
