//! virta-core - shared vocabulary for the virta remote-write queue.
//!
//! This crate holds the types shared between the queue manager and the
//! pluggable edges an embedder supplies:
//!
//! - [`DataPoint`] / [`Labels`] - the observations flowing into the queue
//! - [`WriteClient`] - the transport contract for the remote endpoint
//! - [`RequestEncoder`] and the wire-form types - the serialize/compress seam
//! - [`SendError`] / [`EncodeError`] - the failure vocabulary of both seams
//!
//! # Why this crate exists
//!
//! Embedders implement `WriteClient` (HTTP, gRPC, a test double) and
//! `RequestEncoder` (protobuf + snappy, or anything else the remote speaks)
//! without depending on the queue machinery. Keeping the contracts here
//! means a transport crate and `virta-queue` can evolve independently:
//!
//! ```text
//! virta-core  ◄──  virta-queue
//!     ▲
//!     └─────────── your transport / codec crate
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod client;
mod error;
/// Series label sets and the external-labels overlay.
pub mod labels;
/// Data points and metric metadata.
pub mod point;
/// Wire-form series and the request-encoder contract.
pub mod wire;

pub use client::WriteClient;
pub use error::{EncodeError, SendError};
pub use labels::{Label, Labels};
pub use point::{
    BucketSpan, DataPoint, FloatHistogram, Histogram, MetadataKind, MetricMetadata, PointKind,
};
pub use wire::{
    RequestEncoder, WireExemplar, WireHistogram, WireHistogramValue, WireSample, WireSeries,
};
