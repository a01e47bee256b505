//! Line transport layer for RemoteForge
//!
//! A remote-session engine that frames its own messages only needs a way to
//! send one line and receive one line. This crate supplies that for any
//! point-to-point channel.
//!
//! # Architecture
//!
//! - **Transport trait**: the minimal create / close / write / wait contract
//! - **Runner**: drives a transport with concurrent read, write and
//!   error-stream activities and exposes it as a pair of line queues
//! - **Subprocess transport**: a child process over stdin/stdout/stderr
//! - **Error handling**: one `TransportError` type shared by every transport
//!
//! # Usage
//!
//! ```ignore
//! use remoteforge_transport::{ProcessConfig, ProcessTransport, RunnerConfig, TransportRunner};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let transport = Arc::new(ProcessTransport::new(ProcessConfig::new("cat")));
//! let runner = TransportRunner::new(transport, RunnerConfig::default());
//! let (mut channels, handle) = runner.spawn(CancellationToken::new());
//!
//! channels.outbound.send("ping")?;
//! assert_eq!(channels.inbound.recv().await?.as_deref(), Some("ping"));
//! channels.outbound.complete();
//! handle.await??;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod duration_format;
pub mod error;
pub mod runner;
pub mod subprocess;
pub mod traits;

// Re-export commonly used types
pub use channel::{DuplexChannels, LineReceiver, LineSender, line_channel};
pub use error::{Result, TransportError};
pub use runner::{RunnerConfig, TransportRunner};
pub use subprocess::{ProcessConfig, ProcessTransport};
pub use traits::{BoxedTransport, Transport};
pub use tokio_util::sync::CancellationToken;
