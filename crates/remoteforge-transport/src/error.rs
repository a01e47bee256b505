//! Transport error types

use std::sync::Arc;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
///
/// The type is `Clone` so a single failure can complete the inbound queue
/// and still be returned from the runner.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O error on the underlying channel
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Process error (for subprocess transport)
    #[error("Process error: {0}")]
    Process(String),

    /// Text produced by the transport's error stream
    #[error("{0}")]
    Remote(String),

    /// The transport ended its stream without producing a single line
    #[error("Transport has returned no data before it has been closed")]
    NoData,

    /// A write was attempted after the outbound queue was completed
    #[error("Transport has been closed")]
    Closed,

    /// The transport ended while the session was still expecting data
    #[error("Transport closed before the session was closed")]
    ClosedUnexpectedly,

    /// An operation did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic transport error
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create an error from error-stream text
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Whether this error is the expected shape of a deliberate shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
