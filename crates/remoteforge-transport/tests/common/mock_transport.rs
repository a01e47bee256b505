//! Scripted transport for testing the runner without a real process
//!
//! Reads come from a script of lines, errors and end-of-stream markers.
//! Writes are captured for assertion, or echoed back in echo mode. Call
//! counters let tests check that the runner opened and closed exactly once.

#![allow(dead_code)]

use async_trait::async_trait;
use remoteforge_transport::{Result as TransportResult, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted result of `wait_message`
#[derive(Debug, Clone)]
pub enum Step {
    Line(String),
    Fail(TransportError),
    Eof,
}

/// A transport driven by a script
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    hang_at_end: bool,
    echo_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    echo_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stderr: Option<(String, Duration)>,
    create_error: Option<TransportError>,
    write_error: Option<TransportError>,
    close_delay: Option<Duration>,
    closed: CancellationToken,
    written: Mutex<Vec<String>>,
    create_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn builder() -> ScriptedTransportBuilder {
        ScriptedTransportBuilder::default()
    }

    /// Lines passed to `write_message`
    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self, cancel: &CancellationToken) -> TransportResult<Option<String>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = self.closed.cancelled() => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn create_connection(&self, _cancel: &CancellationToken) -> TransportResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        match &self.create_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn close_connection(&self, _cancel: &CancellationToken) -> TransportResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.echo_tx.lock().unwrap().take();
        self.closed.cancel();
        Ok(())
    }

    async fn write_message(&self, line: &str, _cancel: &CancellationToken) -> TransportResult<()> {
        if let Some(err) = &self.write_error {
            return Err(err.clone());
        }
        self.written.lock().unwrap().push(line.to_string());
        if let Some(tx) = self.echo_tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.to_string());
        }
        Ok(())
    }

    async fn wait_message(&self, cancel: &CancellationToken) -> TransportResult<Option<String>> {
        let mut echo = self.echo_rx.lock().await;
        if let Some(rx) = echo.as_mut() {
            return tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                line = rx.recv() => Ok(line),
            };
        }
        drop(echo);

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Line(line)) => Ok(Some(line)),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Eof) => Ok(None),
            None if self.hang_at_end => self.wait_closed(cancel).await,
            None => Ok(None),
        }
    }

    async fn read_error(&self, cancel: &CancellationToken) -> TransportResult<Option<String>> {
        let Some((text, delay)) = &self.stderr else {
            return Ok(None);
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(*delay) => Ok(Some(text.clone())),
        }
    }
}

/// Builder for [`ScriptedTransport`]
#[derive(Default)]
pub struct ScriptedTransportBuilder {
    script: Vec<Step>,
    hang_at_end: bool,
    echo: bool,
    stderr: Option<(String, Duration)>,
    create_error: Option<TransportError>,
    write_error: Option<TransportError>,
    close_delay: Option<Duration>,
}

impl ScriptedTransportBuilder {
    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.script.push(Step::Line(line.into()));
        self
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .extend(lines.into_iter().map(|l| Step::Line(l.into())));
        self
    }

    pub fn with_read_error(mut self, err: TransportError) -> Self {
        self.script.push(Step::Fail(err));
        self
    }

    pub fn with_eof(mut self) -> Self {
        self.script.push(Step::Eof);
        self
    }

    /// Block reads after the script until closed or cancelled
    pub fn hang_at_end(mut self) -> Self {
        self.hang_at_end = true;
        self
    }

    /// Echo every written line back as a read
    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn with_stderr(mut self, text: impl Into<String>, delay: Duration) -> Self {
        self.stderr = Some((text.into(), delay));
        self
    }

    pub fn with_create_error(mut self, err: TransportError) -> Self {
        self.create_error = Some(err);
        self
    }

    pub fn with_write_error(mut self, err: TransportError) -> Self {
        self.write_error = Some(err);
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub fn build(self) -> Arc<ScriptedTransport> {
        let (echo_tx, echo_rx) = if self.echo {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Arc::new(ScriptedTransport {
            script: Mutex::new(VecDeque::from(self.script)),
            hang_at_end: self.hang_at_end,
            echo_tx: Mutex::new(echo_tx),
            echo_rx: tokio::sync::Mutex::new(echo_rx),
            stderr: self.stderr,
            create_error: self.create_error,
            write_error: self.write_error,
            close_delay: self.close_delay,
            closed: CancellationToken::new(),
            written: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }
}
