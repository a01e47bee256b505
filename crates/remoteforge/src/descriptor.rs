//! Transport descriptors
//!
//! A descriptor is the inert result of resolving a connection string. It
//! creates a fresh live transport every time one is needed and can be
//! recreated freely.

use crate::error::ForgeResult;
use remoteforge_transport::BoxedTransport;
use std::fmt;
use std::sync::Arc;

/// Creates live transports for one resolved target
pub trait TransportDescriptor: Send + Sync {
    /// Create a new live transport
    ///
    /// Nothing is connected yet; the runner calls `create_connection`.
    fn create_transport(&self) -> ForgeResult<BoxedTransport>;

    /// Stable display string for diagnostics, e.g. `ssh:user@host`
    fn transport_string(&self) -> String;
}

/// Type alias for a shared descriptor
pub type BoxedDescriptor = Arc<dyn TransportDescriptor>;

impl fmt::Debug for dyn TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportDescriptor")
            .field(&self.transport_string())
            .finish()
    }
}
