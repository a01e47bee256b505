//! # remoteforge
//!
//! Pluggable transports for a remote-session protocol engine.
//!
//! The host application owns a protocol engine that frames, authenticates and
//! dispatches its own messages. All it needs from a transport is "send a
//! line" and "receive a line". This crate supplies that seam for any
//! line-oriented channel and lets callers pick a transport with a short
//! connection string such as `ssh:admin@server` or `docker:web-1`.
//!
//! ## Architecture
//!
//! ```text
//! connection string
//!     ↓
//! SchemeRegistry (per execution context)
//!     ↓
//! TransportDescriptor ──create──▶ Transport
//!     ↓
//! TransportBridge ◀──▶ HostEngine callbacks
//!     ↓
//! TransportRunner (remoteforge-transport)
//!     ↓
//! child process / socket / in-memory queue
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use remoteforge::{BridgeConfig, ContextRegistryStore, ExecutionContext, TransportBridge};
//!
//! let store = ContextRegistryStore::default();
//! let context = ExecutionContext::new("main");
//!
//! let descriptor = store.resolve(&context, "admin@server:2222")?;
//! assert_eq!(descriptor.transport_string(), "ssh:admin@server:2222");
//!
//! let bridge = TransportBridge::new(descriptor, host_engine, BridgeConfig::default());
//! bridge.start()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod registry;
pub mod session;
pub mod ssh;

pub use bridge::{BridgeConfig, BridgeState, HostEngine, MessageSink, TransportBridge};
pub use context::{ContextRegistryStore, ExecutionContext};
pub use descriptor::{BoxedDescriptor, TransportDescriptor};
pub use error::{ForgeError, ForgeResult};
pub use registry::{
    Registration, RegistrationInfo, RegistryConfig, SchemeRegistry, TransportFactory,
};
pub use session::{OpenedSession, open_all};
pub use ssh::{SshConfig, SshDescriptor, SshTarget};

// Re-export the transport layer so hosts need one dependency
pub use remoteforge_transport as transport;
