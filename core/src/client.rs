//! Transport contract for remote endpoints.

use crate::error::SendError;
use async_trait::async_trait;
use bytes::Bytes;

/// A client capable of storing one opaque, already-encoded request payload
/// in a remote time-series database.
///
/// The queue treats the transport as a black box: it hands over bytes and
/// reads back the three-way disposition encoded in [`SendError`]. The store
/// future is dropped when a hard shutdown or reshard cancels the send, so
/// implementations should not rely on running to completion.
///
/// # Example
///
/// ```ignore
/// use virta_core::{SendError, WriteClient};
/// use async_trait::async_trait;
/// use bytes::Bytes;
///
/// struct HttpClient {
///     client: reqwest::Client,
///     endpoint: String,
/// }
///
/// #[async_trait]
/// impl WriteClient for HttpClient {
///     async fn store(&self, payload: Bytes, _attempt: usize) -> Result<(), SendError> {
///         let resp = self
///             .client
///             .post(&self.endpoint)
///             .body(payload)
///             .send()
///             .await
///             .map_err(|e| SendError::recoverable(e.to_string()))?;
///         match resp.status().as_u16() {
///             200..=299 => Ok(()),
///             429 | 500..=599 => Err(SendError::recoverable(resp.status().to_string())),
///             _ => Err(SendError::fatal(resp.status().to_string())),
///         }
///     }
///
///     fn name(&self) -> &str {
///         "primary"
///     }
///
///     fn endpoint(&self) -> &str {
///         &self.endpoint
///     }
/// }
/// ```
#[async_trait]
pub trait WriteClient: Send + Sync {
    /// Store one encoded request. `attempt` is 0 for the first try and
    /// increments on each retry of the same payload.
    async fn store(&self, payload: Bytes, attempt: usize) -> Result<(), SendError>;

    /// Uniquely identifies the remote storage, for meters and logs.
    fn name(&self) -> &str;

    /// The remote write endpoint URL, for meters and logs.
    fn endpoint(&self) -> &str;
}
