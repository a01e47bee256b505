//! Transport runner
//!
//! Drives a [`Transport`] through open → concurrent read/write loops → close
//! and exposes it to callers as a [`DuplexChannels`] pair.
//!
//! # Activities
//!
//! Once `create_connection` succeeds three activities run at the same time:
//!
//! - **writer**: drains the outbound queue into `write_message`
//! - **reader**: pushes every `wait_message` line onto the inbound queue
//! - **error**: drains `read_error`; any text there fails the inbound queue
//!
//! When the reader hits end of stream it waits a short grace window for the
//! error activity, so a transport that prints its failure to a side channel
//! reports that text instead of the generic [`TransportError::NoData`].
//!
//! `close_connection` runs exactly once after a successful open, however the
//! loops ended, and is bounded by [`RunnerConfig::close_timeout`].

use crate::channel::{DuplexChannels, LineReceiver, LineSender, line_channel};
use crate::error::{Result, TransportError};
use crate::traits::BoxedTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for a [`TransportRunner`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How long a silent end of stream waits for the error stream
    #[serde(with = "crate::duration_format")]
    pub error_grace: Duration,

    /// Upper bound on `close_connection`
    #[serde(with = "crate::duration_format")]
    pub close_timeout: Duration,

    /// Treat an end of stream without any data as a clean close
    pub allow_empty_stream: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            error_grace: Duration::from_millis(200),
            close_timeout: Duration::from_secs(5),
            allow_empty_stream: false,
        }
    }
}

impl RunnerConfig {
    /// Set the error-stream grace window
    pub fn with_error_grace(mut self, grace: Duration) -> Self {
        self.error_grace = grace;
        self
    }

    /// Set the close timeout
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Accept a stream that ends before producing any line
    pub fn with_allow_empty_stream(mut self, allow: bool) -> Self {
        self.allow_empty_stream = allow;
        self
    }
}

/// Runs one transport connection
pub struct TransportRunner {
    transport: BoxedTransport,
    config: RunnerConfig,
}

impl TransportRunner {
    /// Create a runner for the transport
    pub fn new(transport: BoxedTransport, config: RunnerConfig) -> Self {
        Self { transport, config }
    }

    /// Get the runner configuration
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run the transport on a background task
    ///
    /// Returns the channel pair to talk to the transport and the task handle
    /// carrying the result of [`run`](Self::run).
    pub fn spawn(self, cancel: CancellationToken) -> (DuplexChannels, JoinHandle<Result<()>>) {
        let (outbound_tx, outbound_rx) = line_channel();
        let (inbound_tx, inbound_rx) = line_channel();

        let handle = tokio::spawn(async move { self.run(outbound_rx, inbound_tx, cancel).await });

        (
            DuplexChannels {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            handle,
        )
    }

    /// Run the transport until it closes, fails or is cancelled
    ///
    /// Every failure also completes `inbound` with that error, so a consumer
    /// of the inbound queue sees the same reason this call returns. The
    /// inbound queue is always complete when this returns.
    ///
    /// # Errors
    ///
    /// - the `create_connection` error, without calling `close_connection`
    /// - the error the inbound queue failed with (read, error stream, no data)
    /// - the first `write_message` error
    /// - [`TransportError::Timeout`] or the close error if closing failed
    /// - [`TransportError::Cancelled`] if `cancel` fired
    #[tracing::instrument(name = "transport_runner", skip_all)]
    pub async fn run(
        &self,
        mut outbound: LineReceiver,
        inbound: LineSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.transport.create_connection(&cancel) => result,
        };
        if let Err(err) = created {
            if !err.is_cancelled() {
                debug!(error = %err, "transport failed to connect");
            }
            inbound.fail(err.clone());
            return Err(err);
        }
        debug!("transport connection created");

        let activities = cancel.child_token();
        let reader_done = CancellationToken::new();
        let raised = Arc::new(AtomicBool::new(false));
        let (error_done_tx, error_done_rx) = watch::channel(false);

        let mut error_task = self.spawn_error_activity(
            inbound.clone(),
            activities.clone(),
            Arc::clone(&raised),
            error_done_tx,
        );
        let mut reader_task = self.spawn_reader_activity(
            inbound.clone(),
            activities.clone(),
            reader_done.clone(),
            raised,
            error_done_rx,
        );

        let written = self.write_loop(&mut outbound, &reader_done, &cancel).await;
        if let Err(err) = &written {
            if !err.is_cancelled() {
                debug!(error = %err, "transport write failed");
                inbound.fail(err.clone());
            }
        }

        let closed = self.close(&cancel).await;

        // The close may only now end the stream, and the reader then waits a
        // full grace window of its own before deciding on `NoData`.
        let reader_finished = timeout(self.config.error_grace * 2, &mut reader_task)
            .await
            .is_ok();
        activities.cancel();
        if !reader_finished {
            if let Err(e) = (&mut reader_task).await {
                warn!("transport reader activity panicked: {}", e);
            }
        }
        if let Err(e) = (&mut error_task).await {
            warn!("transport error activity panicked: {}", e);
        }

        inbound.complete();

        if cancel.is_cancelled() {
            debug!("transport runner cancelled");
            return Err(TransportError::Cancelled);
        }
        if let Some(err) = inbound.failure() {
            return Err(err);
        }
        written?;
        closed
    }

    async fn write_loop(
        &self,
        outbound: &mut LineReceiver,
        reader_done: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = reader_done.cancelled() => return Ok(()),
                next = outbound.recv() => next,
            };

            let Some(line) = next? else {
                return Ok(());
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = self.transport.write_message(&line, cancel) => result?,
            }
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        match timeout(
            self.config.close_timeout,
            self.transport.close_connection(cancel),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("transport connection closed");
                Ok(())
            }
            Ok(Err(err)) if err.is_cancelled() => Ok(()),
            Ok(Err(err)) => {
                warn!("transport close failed: {}", err);
                Err(err)
            }
            Err(_) => {
                warn!(
                    "transport close did not finish within {:?}",
                    self.config.close_timeout
                );
                Err(TransportError::Timeout(format!(
                    "close_connection did not finish within {:?}",
                    self.config.close_timeout
                )))
            }
        }
    }

    fn spawn_error_activity(
        &self,
        inbound: LineSender,
        cancel: CancellationToken,
        raised: Arc<AtomicBool>,
        done: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = transport.read_error(&cancel) => result,
            };

            match result {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    raised.store(true, Ordering::SeqCst);
                    inbound.fail(TransportError::remote(text.trim_end()));
                }
                Ok(_) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    raised.store(true, Ordering::SeqCst);
                    inbound.fail(err);
                }
            }

            let _ = done.send(true);
        })
    }

    fn spawn_reader_activity(
        &self,
        inbound: LineSender,
        cancel: CancellationToken,
        reader_done: CancellationToken,
        raised: Arc<AtomicBool>,
        mut error_done: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let grace = self.config.error_grace;
        let allow_empty = self.config.allow_empty_stream;

        tokio::spawn(async move {
            let _done = reader_done.drop_guard();
            let mut lines = 0usize;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = transport.wait_message(&cancel) => next,
                };

                match next {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        if inbound.send(line).is_err() {
                            // Consumer has gone away
                            return;
                        }
                        lines += 1;
                    }
                    Ok(_) => break,
                    Err(err) => {
                        if !err.is_cancelled() {
                            inbound.fail(err);
                        }
                        return;
                    }
                }
            }

            debug!(lines, "transport reached end of stream");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = timeout(grace, async {
                    let _ = error_done.wait_for(|done| *done).await;
                }) => {}
            }

            if raised.load(Ordering::SeqCst) {
                return;
            }
            if lines == 0 && !allow_empty {
                inbound.fail(TransportError::NoData);
            } else {
                inbound.complete();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.error_grace, Duration::from_millis(200));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert!(!config.allow_empty_stream);
    }

    #[test]
    fn test_runner_config_builder() {
        let config = RunnerConfig::default()
            .with_error_grace(Duration::from_millis(50))
            .with_close_timeout(Duration::from_secs(1))
            .with_allow_empty_stream(true);

        assert_eq!(config.error_grace, Duration::from_millis(50));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert!(config.allow_empty_stream);
    }

    #[test]
    fn test_runner_config_from_partial_json() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{ "error_grace": "500ms" }"#).unwrap();
        assert_eq!(config.error_grace, Duration::from_millis(500));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_runner_config_rejects_bad_duration() {
        let result: std::result::Result<RunnerConfig, _> =
            serde_json::from_str(r#"{ "close_timeout": "soon" }"#);
        assert!(result.is_err());
    }
}
