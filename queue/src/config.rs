//! Queue tuning options.

use std::time::Duration;
use thiserror::Error;

/// Invalid queue configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_samples_per_send` was zero.
    #[error("max_samples_per_send must be at least 1")]
    ZeroBatchSize,

    /// `min_shards` was zero.
    #[error("min_shards must be at least 1")]
    ZeroMinShards,

    /// `max_shards` was below `min_shards`.
    #[error("max_shards ({max}) must not be below min_shards ({min})")]
    ShardRange {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// `min_backoff` exceeded `max_backoff`.
    #[error("min_backoff must not exceed max_backoff")]
    BackoffRange,
}

/// Tuning options for one remote-write queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-shard buffering target, in data points. Together with
    /// `max_samples_per_send` this sizes the hand-off channel of full
    /// batches each shard keeps in flight.
    pub capacity: usize,

    /// Points per remote call; also the transcoding buffer's base capacity
    /// (exemplars add 10% headroom).
    pub max_samples_per_send: usize,

    /// Flush a partial batch after this long without a full one. Twice this
    /// duration also gates the reshard stall check.
    pub batch_send_deadline: Duration,

    /// Lower bound of the shard count; also the initial count.
    pub min_shards: usize,

    /// Upper bound of the shard count.
    pub max_shards: usize,

    /// Initial retry delay for recoverable send failures.
    pub min_backoff: Duration,

    /// Retry delay ceiling; also caps the producer's enqueue backoff.
    pub max_backoff: Duration,

    /// When rebuilding a request on retry, drop points older than this.
    /// Zero disables age filtering.
    pub sample_age_limit: Duration,

    /// How long a soft shutdown may spend draining before the hard cutoff
    /// discards whatever is still buffered.
    pub flush_deadline: Duration,

    /// Route exemplars to the remote endpoint.
    pub send_exemplars: bool,

    /// Route native histograms to the remote endpoint.
    pub send_native_histograms: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_samples_per_send: 2_000,
            batch_send_deadline: Duration::from_secs(5),
            min_shards: 1,
            max_shards: 50,
            min_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(5),
            sample_age_limit: Duration::ZERO,
            flush_deadline: Duration::from_secs(60),
            send_exemplars: false,
            send_native_histograms: false,
        }
    }
}

impl QueueConfig {
    /// Check the options for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_samples_per_send == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.min_shards == 0 {
            return Err(ConfigError::ZeroMinShards);
        }
        if self.max_shards < self.min_shards {
            return Err(ConfigError::ShardRange {
                min: self.min_shards,
                max: self.max_shards,
            });
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::BackoffRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(QueueConfig::default().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let cfg = QueueConfig {
            max_samples_per_send: 0,
            ..QueueConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBatchSize));

        let cfg = QueueConfig {
            min_shards: 4,
            max_shards: 2,
            ..QueueConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ShardRange { min: 4, max: 2 }));

        let cfg = QueueConfig {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..QueueConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BackoffRange));
    }
}
