//! Per-shard batch buffering.
//!
//! Each shard owns one [`BatchQueue`]: the partial batch currently being
//! appended to, a bounded hand-off channel of full batches its worker
//! drains, and a small pool of recycled batch buffers. The publish into the
//! hand-off never blocks - a full hand-off surfaces to the producer as a
//! rejected append, which is the backpressure signal that ripples all the
//! way back to the caller.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use virta_core::DataPoint;

pub(crate) struct BatchQueue {
    inner: Mutex<Inner>,
    // The pool has its own lock: append and reuse run on different tasks
    // and only meet here.
    pool: Mutex<Vec<Vec<DataPoint>>>,
    pool_capacity: usize,
    batch_size: usize,
}

struct Inner {
    batch: Vec<DataPoint>,
    /// `None` once the queue has shut down; dropping it closes the hand-off.
    tx: Option<mpsc::Sender<Vec<DataPoint>>>,
}

impl BatchQueue {
    /// Create a queue holding at most `⌈capacity / batch_size⌉` full batches
    /// (minimum one) plus one partial. Returns the receiving half of the
    /// hand-off for the shard worker.
    pub(crate) fn new(
        batch_size: usize,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<DataPoint>>) {
        let batches = (capacity / batch_size).max(1);
        let (tx, rx) = mpsc::channel(batches);
        let queue = Self {
            inner: Mutex::new(Inner {
                batch: Vec::with_capacity(batch_size),
                tx: Some(tx),
            }),
            pool: Mutex::new(Vec::with_capacity(batches + 1)),
            pool_capacity: batches + 1,
            batch_size,
        };
        (queue, rx)
    }

    /// Append one point to the partial batch.
    ///
    /// A full partial is published to the hand-off without blocking. When
    /// the hand-off has no room the appended point is popped back off and
    /// handed to the caller for a retry after backoff, keeping the batch at
    /// its capacity invariant.
    pub(crate) fn append(&self, point: DataPoint) -> Result<(), DataPoint> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(tx) = &inner.tx else {
            return Err(point);
        };

        inner.batch.push(point);
        if inner.batch.len() == self.batch_size {
            let full = std::mem::take(&mut inner.batch);
            match tx.try_send(full) {
                Ok(()) => inner.batch = self.recycled_batch(),
                Err(TrySendError::Full(mut full)) | Err(TrySendError::Closed(mut full)) => {
                    // Undo the append; the batch was just filled so the tail
                    // is the point we took.
                    let rejected = full.pop();
                    inner.batch = full;
                    if let Some(rejected) = rejected {
                        return Err(rejected);
                    }
                }
            }
        }
        Ok(())
    }

    /// Take whatever is ready: a queued full batch if one exists, otherwise
    /// the current partial (swapped for a fresh buffer).
    ///
    /// Runs under the batch lock so a producer cannot publish between the
    /// hand-off check and the partial swap - that window would let a newer
    /// partial overtake an older full batch and reorder the shard's stream.
    pub(crate) fn batch(&self, rx: &mut mpsc::Receiver<Vec<DataPoint>>) -> Vec<DataPoint> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match rx.try_recv() {
            Ok(full) => full,
            Err(_) => std::mem::replace(&mut inner.batch, self.recycled_batch()),
        }
    }

    /// Hand a drained batch buffer back for recycling.
    pub(crate) fn return_for_reuse(&self, mut batch: Vec<DataPoint>) {
        batch.clear();
        let mut pool = self.pool.lock();
        if pool.len() < self.pool_capacity {
            pool.push(batch);
        }
    }

    /// Publish the remaining partial batch, then close the hand-off.
    ///
    /// Retries once a second while the hand-off is full; gives up as soon
    /// as `done` fires, since at that point the workers are gone and
    /// whatever is left will be dropped anyway. No append can succeed after
    /// this returns.
    pub(crate) async fn flush_and_shutdown(&self, done: watch::Receiver<bool>) {
        while self.try_publish_partial(&done) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let mut guard = self.inner.lock();
        guard.batch = Vec::new();
        guard.tx = None;
    }

    /// Returns true when publishing must be retried later.
    fn try_publish_partial(&self, done: &watch::Receiver<bool>) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.batch.is_empty() {
            return false;
        }
        let Some(tx) = &inner.tx else {
            return false;
        };
        if *done.borrow() {
            return false;
        }

        let batch = std::mem::take(&mut inner.batch);
        match tx.try_send(batch) {
            Ok(()) => false,
            Err(TrySendError::Full(batch)) => {
                inner.batch = batch;
                true
            }
            Err(TrySendError::Closed(batch)) => {
                inner.batch = batch;
                false
            }
        }
    }

    fn recycled_batch(&self) -> Vec<DataPoint> {
        let mut pool = self.pool.lock();
        pool.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.batch_size))
    }

    #[cfg(test)]
    fn partial_len(&self) -> usize {
        self.inner.lock().batch.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use virta_core::Labels;

    fn point(ts: i64) -> DataPoint {
        DataPoint::sample(Labels::from_pairs([("__name__", "up")]), 1.0, ts)
    }

    #[tokio::test]
    async fn hand_off_capacity_has_a_floor_of_one() {
        // capacity below batch size still leaves room for one full batch.
        let (queue, _rx) = BatchQueue::new(2, 1);
        queue.append(point(0)).unwrap();
        queue.append(point(1)).unwrap();

        // A second full batch has nowhere to go.
        queue.append(point(2)).unwrap();
        assert!(queue.append(point(3)).is_err());
    }

    #[tokio::test]
    async fn hand_off_capacity_follows_the_configured_ratio() {
        // batch size 1: every accepted point is one published batch.
        let (queue, _rx) = BatchQueue::new(1, 20);
        for ts in 0..20 {
            queue.append(point(ts)).unwrap();
        }
        assert!(queue.append(point(20)).is_err());
    }

    #[tokio::test]
    async fn full_partial_is_published() {
        let (queue, mut rx) = BatchQueue::new(3, 3);

        for ts in 0..3 {
            queue.append(point(ts)).unwrap();
        }
        assert_eq!(queue.partial_len(), 0);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].timestamp, 0);
        assert_eq!(batch[2].timestamp, 2);
    }

    #[tokio::test]
    async fn append_rejects_when_hand_off_is_full() {
        // capacity 3 / batch 3 => one full batch in flight.
        let (queue, mut rx) = BatchQueue::new(3, 3);

        for ts in 0..3 {
            queue.append(point(ts)).unwrap();
        }
        queue.append(point(3)).unwrap();
        queue.append(point(4)).unwrap();

        // This append would complete a second batch, but the hand-off has
        // no room: the point comes back and the partial stays one short.
        let rejected = queue.append(point(5)).unwrap_err();
        assert_eq!(rejected.timestamp, 5);
        assert_eq!(queue.partial_len(), 2);

        // Draining the hand-off unblocks the retry.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 3);
        queue.append(rejected).unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second[2].timestamp, 5);
    }

    #[tokio::test]
    async fn batch_prefers_queued_full_batches_over_the_partial() {
        let (queue, mut rx) = BatchQueue::new(2, 4);

        // One full batch into the hand-off, one point in the partial.
        for ts in 0..2 {
            queue.append(point(ts)).unwrap();
        }
        queue.append(point(2)).unwrap();

        // The queued batch must come out before the newer partial.
        let first = queue.batch(&mut rx);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].timestamp, 0);

        let second = queue.batch(&mut rx);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp, 2);

        // Nothing left.
        assert!(queue.batch(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn flush_and_shutdown_publishes_partial_and_closes() {
        let (queue, mut rx) = BatchQueue::new(10, 10);
        queue.append(point(1)).unwrap();
        queue.append(point(2)).unwrap();

        let (_done_tx, done_rx) = watch::channel(false);
        queue.flush_and_shutdown(done_rx).await;

        let partial = rx.recv().await.unwrap();
        assert_eq!(partial.len(), 2);
        // Channel closed afterwards.
        assert!(rx.recv().await.is_none());

        // Appends after shutdown bounce.
        assert!(queue.append(point(3)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_and_shutdown_gives_up_once_done_fires() {
        // Hand-off full and nobody draining: flush would retry forever.
        let (queue, _rx) = BatchQueue::new(2, 2);
        for ts in 0..2 {
            queue.append(point(ts)).unwrap();
        }
        queue.append(point(2)).unwrap();

        let (done_tx, done_rx) = watch::channel(false);
        done_tx.send(true).unwrap();

        // Completes promptly instead of looping on the 1s retry cadence.
        queue.flush_and_shutdown(done_rx).await;
        assert!(queue.append(point(3)).is_err());
    }

    #[tokio::test]
    async fn pool_recycles_buffers_up_to_capacity() {
        let (queue, mut rx) = BatchQueue::new(2, 4);

        for ts in 0..2 {
            queue.append(point(ts)).unwrap();
        }
        let batch = rx.try_recv().unwrap();
        let cap_before = batch.capacity();
        queue.return_for_reuse(batch);

        // The next full batch reuses the pooled buffer.
        for ts in 2..4 {
            queue.append(point(ts)).unwrap();
        }
        assert_eq!(queue.partial_len(), 0);
        let recycled = rx.try_recv().unwrap();
        assert_eq!(recycled.capacity(), cap_before);
    }
}
