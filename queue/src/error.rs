//! Error types for queue construction and lifecycle.

use crate::config::ConfigError;
use thiserror::Error;

/// Failure to construct or start a queue manager.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Configuration rejected by validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metric construction or registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
