//! Example: A custom scheme over a child process
//!
//! This example demonstrates:
//! - Registering a scheme with a factory
//! - Resolving connection strings in an execution context
//! - Driving a transport through the bridge with a minimal host engine
//!
//! The `exec` scheme runs whatever command follows the colon and talks to it
//! over stdio. `exec:cat` echoes every line back, which stands in for a
//! remote shell here.
//!
//! Run with: cargo run --example echo_forge
//! Set RUST_LOG=remoteforge=debug to see the lifecycle.

use remoteforge::transport::{BoxedTransport, ProcessConfig, ProcessTransport};
use remoteforge::{
    BridgeConfig, ContextRegistryStore, ExecutionContext, ForgeError, ForgeResult, HostEngine,
    MessageSink, TransportBridge, TransportDescriptor,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Runs a command line as the transport
struct ExecDescriptor {
    command: Vec<String>,
}

impl TransportDescriptor for ExecDescriptor {
    fn create_transport(&self) -> ForgeResult<BoxedTransport> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ForgeError::invalid("", "no command given"))?;
        Ok(Arc::new(ProcessTransport::new(
            ProcessConfig::new(program).with_args(args.iter().cloned()),
        )))
    }

    fn transport_string(&self) -> String {
        format!("exec:{}", self.command.join(" "))
    }
}

/// Host engine that sends a few lines and forwards replies to a channel
struct PrintingHost {
    sink: Mutex<Option<MessageSink>>,
    replies: mpsc::UnboundedSender<String>,
}

impl HostEngine for PrintingHost {
    fn install_sink(&self, sink: MessageSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn ready_to_send(&self) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            for line in ["hello", "from", "remoteforge"] {
                if let Err(e) = sink.write_line(line) {
                    eprintln!("write failed: {}", e);
                }
            }
        }
    }

    fn deliver_line(&self, line: String) {
        let _ = self.replies.send(line);
    }

    fn report_error(&self, error: ForgeError) {
        eprintln!("❌ transport failed: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Step 1: Register the scheme in a context
    let store = ContextRegistryStore::default();
    let context = ExecutionContext::new("example");
    let registry = store.registry_for(&context)?;
    registry.register(
        "exec",
        Arc::new(|info: &str| {
            let command: Vec<String> = info.split_whitespace().map(String::from).collect();
            if command.is_empty() {
                return Err(ForgeError::invalid(info, "no command given"));
            }
            Ok(Arc::new(ExecDescriptor { command }) as Arc<dyn TransportDescriptor>)
        }),
        Some("Runs a local command".to_string()),
        false,
    )?;

    println!("Registered schemes:");
    for info in registry.registrations() {
        println!(
            "  {:<6} {}",
            info.name,
            info.description.as_deref().unwrap_or("")
        );
    }

    // Step 2: Resolve and start
    let descriptor = store.resolve(&context, "exec:cat")?;
    println!("\nConnecting to {}", descriptor.transport_string());

    let (tx, mut replies) = mpsc::unbounded_channel();
    let host = Arc::new(PrintingHost {
        sink: Mutex::new(None),
        replies: tx,
    });
    let bridge = TransportBridge::new(descriptor, host, BridgeConfig::default());
    bridge.start()?;

    // Step 3: Read the echoes back
    for _ in 0..3 {
        match replies.recv().await {
            Some(line) => println!("✅ received: {}", line),
            None => break,
        }
    }

    // Step 4: Close gracefully
    bridge.notify_closed()?;
    bridge.dispose().await?;
    println!("\nSession ended in state {:?}", bridge.state());

    Ok(())
}
