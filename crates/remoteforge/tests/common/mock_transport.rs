//! Mock transports and host engine for testing without real processes
//!
//! The `mock` scheme understands these connection string remainders:
//!
//! - `echo`: every written line is read back
//! - `lines=a,b,c`: reads the given lines, then ends the stream
//! - `hang`: never produces anything until closed or cancelled
//! - `stderr=text`: ends the stream and reports `text` on the error channel
//! - `fail=text`: `create_connection` fails with `text`
//! - `slowclose`: like `hang`, but closing takes far longer than any test waits

#![allow(dead_code)]

use async_trait::async_trait;
use remoteforge::transport::{BoxedTransport, Result as TransportResult, Transport, TransportError};
use remoteforge::{
    BoxedDescriptor, ForgeError, ForgeResult, HostEngine, MessageSink, TransportDescriptor,
    TransportFactory,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

/// What a mock transport does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Echo,
    Lines(Vec<String>),
    Hang,
    Stderr(String),
    FailConnect(String),
    SlowClose,
}

impl Behavior {
    pub fn parse(info: &str) -> ForgeResult<Self> {
        let (kind, arg) = info.split_once('=').unwrap_or((info, ""));
        match kind {
            "echo" => Ok(Self::Echo),
            "hang" => Ok(Self::Hang),
            "slowclose" => Ok(Self::SlowClose),
            "lines" => Ok(Self::Lines(arg.split(',').map(String::from).collect())),
            "stderr" => Ok(Self::Stderr(arg.to_string())),
            "fail" => Ok(Self::FailConnect(arg.to_string())),
            _ => Err(ForgeError::invalid(info, "unknown mock behavior")),
        }
    }
}

/// Counters shared by every transport a descriptor creates
#[derive(Debug, Default)]
pub struct MockStats {
    pub created: AtomicUsize,
    pub connected: AtomicUsize,
    pub closed: AtomicUsize,
}

impl MockStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An in-memory transport
pub struct MockTransport {
    behavior: Behavior,
    stats: Arc<MockStats>,
    script: Mutex<VecDeque<String>>,
    echo_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    echo_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

impl MockTransport {
    pub fn new(behavior: Behavior, stats: Arc<MockStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = match &behavior {
            Behavior::Lines(lines) => lines.iter().cloned().collect(),
            _ => VecDeque::new(),
        };
        Self {
            behavior,
            stats,
            script: Mutex::new(script),
            echo_tx: Mutex::new(Some(tx)),
            echo_rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_connection(&self, _cancel: &CancellationToken) -> TransportResult<()> {
        if let Behavior::FailConnect(msg) = &self.behavior {
            return Err(TransportError::connection(msg.clone()));
        }
        self.stats.connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_connection(&self, _cancel: &CancellationToken) -> TransportResult<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        if self.behavior == Behavior::SlowClose {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.echo_tx.lock().unwrap().take();
        self.closed.cancel();
        Ok(())
    }

    async fn write_message(&self, line: &str, _cancel: &CancellationToken) -> TransportResult<()> {
        if self.behavior == Behavior::Echo {
            if let Some(tx) = self.echo_tx.lock().unwrap().as_ref() {
                let _ = tx.send(line.to_string());
            }
        }
        Ok(())
    }

    async fn wait_message(&self, cancel: &CancellationToken) -> TransportResult<Option<String>> {
        match &self.behavior {
            Behavior::Echo => {
                let mut rx = self.echo_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Cancelled),
                    line = rx.recv() => Ok(line),
                }
            }
            Behavior::Lines(_) => Ok(self.script.lock().unwrap().pop_front()),
            Behavior::Hang | Behavior::SlowClose => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Cancelled),
                    _ = self.closed.cancelled() => Ok(None),
                }
            }
            Behavior::Stderr(_) | Behavior::FailConnect(_) => Ok(None),
        }
    }

    async fn read_error(&self, _cancel: &CancellationToken) -> TransportResult<Option<String>> {
        match &self.behavior {
            Behavior::Stderr(text) => Ok(Some(text.clone())),
            _ => Ok(None),
        }
    }
}

/// Descriptor creating [`MockTransport`]s
pub struct MockDescriptor {
    pub behavior: Behavior,
    pub stats: Arc<MockStats>,
}

impl MockDescriptor {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            stats: Arc::new(MockStats::default()),
        })
    }
}

impl TransportDescriptor for MockDescriptor {
    fn create_transport(&self) -> ForgeResult<BoxedTransport> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport::new(
            self.behavior.clone(),
            Arc::clone(&self.stats),
        )))
    }

    fn transport_string(&self) -> String {
        format!("mock:{:?}", self.behavior)
    }
}

/// Factory for the `mock` scheme
pub fn mock_factory() -> TransportFactory {
    Arc::new(|info: &str| Ok(MockDescriptor::new(Behavior::parse(info)?) as BoxedDescriptor))
}

/// Host engine that records everything the bridge tells it
#[derive(Default)]
pub struct RecordingHost {
    greeting: Vec<String>,
    sink: Mutex<Option<MessageSink>>,
    lines: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    ready_calls: AtomicUsize,
    changed: Notify,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Send these lines as soon as the bridge is ready
    pub fn with_greeting<I, S>(lines: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            greeting: lines.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    pub fn sink(&self) -> Option<MessageSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` lines arrived or `wait` elapsed
    pub async fn wait_lines(&self, count: usize, wait: Duration) -> Vec<String> {
        self.wait_until(wait, || self.lines.lock().unwrap().len() >= count)
            .await;
        self.lines()
    }

    /// Wait for the first reported error
    pub async fn wait_error(&self, wait: Duration) -> Option<String> {
        self.wait_until(wait, || !self.errors.lock().unwrap().is_empty())
            .await;
        self.errors().into_iter().next()
    }

    async fn wait_until(&self, wait: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + wait;
        loop {
            let changed = self.changed.notified();
            if done() {
                return;
            }
            if timeout_at(deadline, changed).await.is_err() {
                return;
            }
        }
    }
}

impl HostEngine for RecordingHost {
    fn install_sink(&self, sink: MessageSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn ready_to_send(&self) {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = self.sink() {
            for line in &self.greeting {
                sink.write_line(line.as_str()).unwrap();
            }
        }
    }

    fn deliver_line(&self, line: String) {
        self.lines.lock().unwrap().push(line);
        self.changed.notify_waiters();
    }

    fn report_error(&self, error: ForgeError) {
        self.errors.lock().unwrap().push(error.to_string());
        self.changed.notify_waiters();
    }
}
