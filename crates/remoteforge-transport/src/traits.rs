//! Transport trait
//!
//! Defines the minimal contract a line-oriented transport has to supply.
//! Everything else (concurrent read/write loops, error-stream draining,
//! close handling) is done by [`TransportRunner`](crate::TransportRunner).

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Generic line transport
///
/// All methods take `&self` because the runner reads, writes and drains the
/// error stream at the same time. Implementations keep each stream behind its
/// own lock.
///
/// Every method receives the session's cancellation token. A well-behaved
/// transport returns promptly once it fires; the runner also stops awaiting
/// the call on cancellation.
///
/// # Example
///
/// ```ignore
/// use remoteforge_transport::{Transport, Result};
/// use tokio_util::sync::CancellationToken;
///
/// struct Loopback { /* ... */ }
///
/// #[async_trait::async_trait]
/// impl Transport for Loopback {
///     async fn create_connection(&self, _cancel: &CancellationToken) -> Result<()> { Ok(()) }
///     async fn close_connection(&self, _cancel: &CancellationToken) -> Result<()> { Ok(()) }
///     async fn write_message(&self, line: &str, _cancel: &CancellationToken) -> Result<()> { /* ... */ }
///     async fn wait_message(&self, _cancel: &CancellationToken) -> Result<Option<String>> { /* ... */ }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying connection
    ///
    /// Called once per live session. A failure here is reported to the
    /// caller opening the session and is not retried.
    async fn create_connection(&self, cancel: &CancellationToken) -> Result<()>;

    /// Release the connection
    ///
    /// Must tolerate a partially failed `create_connection` and must not
    /// fail because the connection is already closed.
    async fn close_connection(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send one line to the target
    ///
    /// A failure means the transport is unusable from then on.
    async fn write_message(&self, line: &str, cancel: &CancellationToken) -> Result<()>;

    /// Wait for the next line from the target
    ///
    /// Returns `None` (or a blank line) when the transport closed normally.
    async fn wait_message(&self, cancel: &CancellationToken) -> Result<Option<String>>;

    /// Read the transport's side error channel
    ///
    /// Not every transport has one; the default reports no error. Non-blank
    /// text returned here is treated as the reason the session failed.
    async fn read_error(&self, _cancel: &CancellationToken) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Type alias for a shared transport
pub type BoxedTransport = std::sync::Arc<dyn Transport>;
