//! virta-queue - sharded remote-write queue manager.
//!
//! Accepts a stream of time-series data points from an upstream producer,
//! batches them per shard, and delivers them to a remote endpoint through a
//! pluggable [`WriteClient`], with bounded in-memory buffering, adaptive
//! parallelism, retry with backoff, and bounded-loss shutdown.
//!
//! ```text
//! append* ──► shard set ──► per-shard batches ──► workers ──► backoff ──► WriteClient
//!                ▲                                   │
//!                └──── reshard ◄── rescaler ◄── EWMA meters
//! ```
//!
//! Three mechanisms carry the design:
//!
//! - **Sharded buffering with backpressure.** Each shard builds batches in
//!   a bounded queue; a full shard rejects the enqueue and the producer
//!   backs off. Nothing is dropped on the way in.
//! - **Adaptive shard sizing.** A control loop estimates arrival rate,
//!   drain rate and latency with EWMAs and rescales the shard count with
//!   hysteresis.
//! - **Two-phase shutdown.** Soft stop drains partial batches within a
//!   deadline; hard stop cancels in-flight sends and accounts every dropped
//!   point.
//!
//! Ordering is guaranteed per shard (and therefore per series); the remote
//! must tolerate duplicate batches from retry chains.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

mod backoff;
mod batch;
pub mod config;
mod error;
pub mod ewma;
pub mod manager;
mod metrics;
mod request;
mod rescale;
mod shards;
pub mod timestamp;
mod worker;

pub use config::{ConfigError, QueueConfig};
pub use error::QueueError;
pub use ewma::EwmaRate;
pub use manager::{QueueManager, QueueManagerBuilder};
pub use metrics::{REASON_DROPPED_SERIES, REASON_TOO_OLD, REASON_UNINTENTIONAL_DROPPED_SERIES};
pub use timestamp::MaxTimestamp;

// The vocabulary types embedders implement against.
pub use virta_core::{
    DataPoint, EncodeError, FloatHistogram, Histogram, Label, Labels, MetadataKind,
    MetricMetadata, PointKind, RequestEncoder, SendError, WireSeries, WriteClient,
};
