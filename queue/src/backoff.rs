//! Retry loop for sends to the remote endpoint.
//!
//! Recoverable failures are retried with exponential backoff and no retry
//! cap: while the remote is down the shard stops draining, its hand-off
//! fills, and producers stall on rejected enqueues. That unbounded retry
//! *is* the backpressure mechanism; only a non-recoverable error or a
//! shutdown breaks the loop.

use crate::config::QueueConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use virta_core::SendError;

/// One send's hooks into the retry loop.
#[async_trait]
pub(crate) trait SendAttempt: Send {
    /// Perform one store attempt. `try_index` is 0 on the first try.
    async fn attempt(&mut self, try_index: usize) -> Result<(), SendError>;

    /// Called after each recoverable failure, before the next attempt.
    fn on_retry(&mut self);
}

/// Drive `sender` until it succeeds, fails non-recoverably, or `shutdown`
/// fires.
///
/// The sleep between attempts starts at `min_backoff`, is overridden by a
/// positive server `retry_after`, and doubles after each attempt with
/// `max_backoff` clamping the doubled value. A non-positive `retry_after`
/// is ignored.
pub(crate) async fn send_with_backoff<A: SendAttempt>(
    cfg: &QueueConfig,
    shutdown: &mut watch::Receiver<bool>,
    sender: &mut A,
) -> Result<(), SendError> {
    let mut backoff = cfg.min_backoff;
    let mut try_index = 0usize;

    loop {
        if *shutdown.borrow() {
            return Err(SendError::Canceled);
        }

        let result = tokio::select! {
            result = sender.attempt(try_index) => result,
            _ = canceled(shutdown) => return Err(SendError::Canceled),
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let SendError::Recoverable { retry_after, .. } = &err else {
            return Err(err);
        };

        let mut sleep = backoff;
        match retry_after {
            Some(ms) if *ms > 0 => {
                sleep = Duration::from_millis(*ms as u64);
                info!(
                    retry_after_ms = ms,
                    "retrying after duration specified by the server"
                );
            }
            Some(_) => {
                debug!("server retry-after lies in the past, using default backoff");
            }
            None => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = canceled(shutdown) => {}
        }

        sender.on_retry();
        warn!(error = %err, try_index, "failed to send batch, retrying");

        backoff = (sleep * 2).min(cfg.max_backoff);
        try_index += 1;
    }
}

/// Resolves once the shutdown signal turns true (or its sender is gone,
/// which only happens when the owning shard generation is torn down).
async fn canceled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Fails with a scripted sequence of errors, then succeeds.
    struct ScriptedSender {
        script: Vec<SendError>,
        attempts: Arc<AtomicUsize>,
        retries: Arc<AtomicUsize>,
    }

    impl ScriptedSender {
        fn new(script: Vec<SendError>) -> Self {
            Self {
                script,
                attempts: Arc::new(AtomicUsize::new(0)),
                retries: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SendAttempt for ScriptedSender {
        async fn attempt(&mut self, try_index: usize) -> Result<(), SendError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            assert_eq!(try_index, n);
            match self.script.get(n) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        fn on_retry(&mut self) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cfg() -> QueueConfig {
        QueueConfig {
            min_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_millis(200),
            ..QueueConfig::default()
        }
    }

    fn live_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retry() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![]);

        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sender.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_error_returns_immediately() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![SendError::fatal("400")]);

        let err = send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap_err();
        assert_eq!(err, SendError::fatal("400"));
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sender.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_errors_back_off_exponentially() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![
            SendError::recoverable("503"),
            SendError::recoverable("503"),
            SendError::recoverable("503"),
        ]);

        let start = Instant::now();
        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();

        // 30 + 60 + 120 ms of sleeping under the paused clock.
        assert_eq!(start.elapsed(), Duration::from_millis(210));
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(sender.retries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_clamped_at_max() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender =
            ScriptedSender::new(vec![SendError::recoverable("503"); 5]);

        let start = Instant::now();
        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();

        // 30 + 60 + 120 + 200 + 200: doubling stops at max_backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(610));
    }

    #[tokio::test(start_paused = true)]
    async fn positive_retry_after_overrides_the_sleep() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![SendError::recoverable_after("429", 500)]);

        let start = Instant::now();
        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_feeds_the_next_doubling() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![
            SendError::recoverable_after("429", 80),
            SendError::recoverable("503"),
        ]);

        let start = Instant::now();
        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();

        // 80 (server hint) then 160 (doubled hint, still under the cap).
        assert_eq!(start.elapsed(), Duration::from_millis(240));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_retry_after_is_ignored() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender = ScriptedSender::new(vec![SendError::recoverable_after("429", -5_000)]);

        let start = Instant::now();
        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_unbounded_until_success() {
        let (_tx, mut shutdown) = live_shutdown();
        let mut sender =
            ScriptedSender::new(vec![SendError::recoverable("503"); 50]);

        send_with_backoff(&cfg(), &mut shutdown, &mut sender)
            .await
            .unwrap();
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 51);
        assert_eq!(sender.retries.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_sleep_cancels() {
        let (tx, mut shutdown) = live_shutdown();
        let mut sender =
            ScriptedSender::new(vec![SendError::recoverable("503"); 100]);

        let handle = tokio::spawn(async move {
            let result = send_with_backoff(&cfg(), &mut shutdown, &mut sender).await;
            (result, sender.attempts.load(Ordering::SeqCst))
        });

        tokio::time::sleep(Duration::from_millis(45)).await;
        tx.send(true).unwrap();

        let (result, attempts) = handle.await.unwrap();
        assert_eq!(result, Err(SendError::Canceled));
        assert!(attempts < 100);
    }

    /// An attempt that never resolves; only cancellation can break it.
    struct HungSender;

    #[async_trait]
    impl SendAttempt for HungSender {
        async fn attempt(&mut self, _try_index: usize) -> Result<(), SendError> {
            std::future::pending().await
        }

        fn on_retry(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_an_in_flight_attempt() {
        let (tx, mut shutdown) = live_shutdown();

        let handle = tokio::spawn(async move {
            send_with_backoff(&cfg(), &mut shutdown, &mut HungSender).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Err(SendError::Canceled));
    }
}
