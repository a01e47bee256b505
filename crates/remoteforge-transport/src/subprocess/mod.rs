//! Subprocess transport
//!
//! Runs a child process and talks to it line by line over stdin/stdout,
//! with stderr as the error channel.

pub mod process;

pub use process::{ProcessConfig, ProcessTransport};
