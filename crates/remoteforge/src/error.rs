//! Error types for scheme resolution and transport sessions

use remoteforge_transport::TransportError;
use thiserror::Error;

/// Result type for RemoteForge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Error types for RemoteForge operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForgeError {
    /// A scheme with that name is already registered
    #[error("A forge with the name '{0}' has already been registered")]
    DuplicateScheme(String),

    /// No scheme with that name is registered
    #[error("No forge has been registered with the name '{0}'")]
    SchemeNotFound(String),

    /// A factory rejected the connection string
    #[error("Invalid connection string '{input}': {reason}")]
    InvalidConnectionString {
        /// The remainder handed to the factory
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// The transport failed; this is what the host engine sees
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The bridge has already been started
    #[error("Transport bridge has already been started")]
    AlreadyStarted,

    /// The bridge has not been started
    #[error("Transport bridge has not been started")]
    NotStarted,

    /// Background work did not finish within the teardown bound
    #[error("Transport teardown did not finish within {0:?}")]
    TeardownTimedOut(std::time::Duration),

    /// Opening one of several targets failed
    #[error("Failed to open '{target}': {source}")]
    OpenFailed {
        /// The connection string as the caller supplied it
        target: String,
        /// Why it failed
        #[source]
        source: Box<ForgeError>,
    },
}

impl ForgeError {
    /// Create an invalid connection string error
    pub fn invalid(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConnectionString {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Tag an error with the connection string it belongs to
    pub fn open_failed(target: impl Into<String>, source: ForgeError) -> Self {
        Self::OpenFailed {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error is a deliberate cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_cancelled(),
            Self::OpenFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The underlying transport error, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            Self::OpenFailed { source, .. } => source.transport_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_scheme_message() {
        let err = ForgeError::DuplicateScheme("ssh".into());
        assert_eq!(
            err.to_string(),
            "A forge with the name 'ssh' has already been registered"
        );
    }

    #[test]
    fn test_open_failed_keeps_target_and_source() {
        let err = ForgeError::open_failed(
            "ssh:nowhere",
            TransportError::remote("Could not resolve hostname").into(),
        );
        assert_eq!(
            err.to_string(),
            "Failed to open 'ssh:nowhere': Transport error: Could not resolve hostname"
        );
        assert!(matches!(
            err.transport_error(),
            Some(TransportError::Remote(_))
        ));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_transport_is_cancelled() {
        let err: ForgeError = TransportError::Cancelled.into();
        assert!(err.is_cancelled());
        assert!(!ForgeError::NotStarted.is_cancelled());
    }
}
