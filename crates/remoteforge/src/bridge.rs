//! Transport bridge
//!
//! Connects a host protocol engine, which works through callbacks, to a
//! [`TransportRunner`], which works through line queues.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start──▶ Opening ──first line──▶ Running ──notify_closed/close──▶ Closing ──dispose──▶ Closed
//!                    │                       │
//!                    └────── failure ────────┴──▶ Faulted
//! ```
//!
//! `Faulted` is absorbing. The host hears about a failure once, through
//! [`HostEngine::report_error`]; cancellation is never reported.
//!
//! ## Example
//!
//! ```ignore
//! use remoteforge::{BridgeConfig, SchemeRegistry, TransportBridge};
//!
//! let registry = SchemeRegistry::from_config(&Default::default())?;
//! let descriptor = registry.resolve("ssh:admin@server")?;
//!
//! let bridge = TransportBridge::new(descriptor, host_engine, BridgeConfig::default());
//! bridge.start()?;
//! // ... host engine exchanges lines through the installed sink ...
//! bridge.notify_closed()?;
//! bridge.dispose().await?;
//! ```

use remoteforge_transport::{
    LineReceiver, LineSender, RunnerConfig, TransportError, TransportRunner, line_channel,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::descriptor::BoxedDescriptor;
use crate::error::{ForgeError, ForgeResult};

/// Callbacks of the host protocol engine
///
/// None of these may block for long: `deliver_line` is called from the
/// relay task and `install_sink`/`ready_to_send` from [`TransportBridge::start`].
/// `report_error` runs on a blocking thread, so the host may tear itself
/// down from there.
pub trait HostEngine: Send + Sync + 'static {
    /// Receive the sink the engine writes outgoing lines to
    fn install_sink(&self, sink: MessageSink);

    /// The transport is set up; the engine may start sending
    fn ready_to_send(&self);

    /// One line from the remote side, in order
    fn deliver_line(&self, line: String);

    /// The transport failed; called at most once per session
    fn report_error(&self, error: ForgeError);
}

/// Writer half handed to the host engine
#[derive(Clone, Debug)]
pub struct MessageSink {
    outbound: LineSender,
}

impl MessageSink {
    /// Queue one line for the transport
    ///
    /// Never blocks. Once the session is closing every write fails with
    /// [`io::ErrorKind::BrokenPipe`].
    pub fn write_line(&self, line: impl Into<String>) -> io::Result<()> {
        self.outbound.send(line).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, TransportError::Closed.to_string())
        })
    }

    /// Whether writes will fail
    pub fn is_closed(&self) -> bool {
        self.outbound.is_completed()
    }
}

/// Bridge lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeState {
    /// Created, not started
    Idle,
    /// Started, nothing received yet
    Opening,
    /// At least one line received
    Running,
    /// The host asked to close
    Closing,
    /// Torn down
    Closed,
    /// The transport failed
    Faulted,
}

impl BridgeState {
    /// Whether the session has ended, cleanly or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

/// Configuration for a [`TransportBridge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Settings for the runner driving the transport
    pub runner: RunnerConfig,

    /// Upper bound on waiting for background work in `dispose`
    #[serde(with = "remoteforge_transport::duration_format")]
    pub dispose_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            dispose_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    /// Set the runner configuration
    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    /// Set the dispose timeout
    pub fn with_dispose_timeout(mut self, dispose_timeout: Duration) -> Self {
        self.dispose_timeout = dispose_timeout;
        self
    }
}

/// State shared by the bridge and its background tasks
struct Shared {
    id: Uuid,
    host: Arc<dyn HostEngine>,
    state: watch::Sender<BridgeState>,
    has_read: AtomicBool,
    close_requested: AtomicBool,
    reported: AtomicBool,
    fault: Mutex<Option<TransportError>>,
}

impl Shared {
    fn transition(&self, from: &[BridgeState], to: BridgeState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!(session = %self.id, from = ?state, to = ?to, "bridge state change");
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn fault_slot(&self) -> MutexGuard<'_, Option<TransportError>> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `Faulted` and report to the host, once
    fn fault(&self, error: TransportError) {
        if error.is_cancelled() || self.reported.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(session = %self.id, error = %error, "transport faulted");
        *self.fault_slot() = Some(error.clone());
        self.transition(
            &[BridgeState::Opening, BridgeState::Running],
            BridgeState::Faulted,
        );

        // The host may block on its own teardown while handling the error.
        let host = Arc::clone(&self.host);
        tokio::task::spawn_blocking(move || host.report_error(ForgeError::Transport(error)));
    }
}

struct LiveSession {
    cancel: CancellationToken,
    outbound: LineSender,
    worker: JoinHandle<ForgeResult<()>>,
    relay: JoinHandle<()>,
}

/// Adapter between one host engine session and one transport
///
/// A bridge runs at most one session. Dropping it cancels the session.
pub struct TransportBridge {
    descriptor: BoxedDescriptor,
    config: BridgeConfig,
    shared: Arc<Shared>,
    session: Mutex<Option<LiveSession>>,
}

impl TransportBridge {
    /// Create a bridge; nothing runs until [`start`](Self::start)
    pub fn new(
        descriptor: BoxedDescriptor,
        host: Arc<dyn HostEngine>,
        config: BridgeConfig,
    ) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            descriptor,
            config,
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                host,
                state,
                has_read: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                reported: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
            session: Mutex::new(None),
        }
    }

    /// Session id used in logs
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current state
    pub fn state(&self) -> BridgeState {
        *self.shared.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.shared.state.subscribe()
    }

    /// The descriptor this bridge connects with
    pub fn descriptor(&self) -> &BoxedDescriptor {
        &self.descriptor
    }

    /// Whether any line has been received
    pub fn has_read(&self) -> bool {
        self.shared.has_read.load(Ordering::SeqCst)
    }

    /// The failure reported to the host, if any
    pub fn fault(&self) -> Option<TransportError> {
        self.shared.fault_slot().clone()
    }

    fn session(&self) -> MutexGuard<'_, Option<LiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the session
    ///
    /// Creates the transport, installs a [`MessageSink`] on the host engine,
    /// spawns the background work and signals
    /// [`HostEngine::ready_to_send`]. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ForgeError::AlreadyStarted`] on a second call
    /// - the descriptor's error if the transport cannot be created
    #[tracing::instrument(
        name = "bridge_start",
        skip(self),
        fields(session = %self.shared.id, transport = %self.descriptor.transport_string())
    )]
    pub fn start(&self) -> ForgeResult<()> {
        let mut session = self.session();
        if session.is_some() || !self.shared.transition(&[BridgeState::Idle], BridgeState::Opening)
        {
            return Err(ForgeError::AlreadyStarted);
        }

        let transport = match self.descriptor.create_transport() {
            Ok(transport) => transport,
            Err(e) => {
                self.shared.transition(&[BridgeState::Opening], BridgeState::Faulted);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = line_channel();
        let (inbound_tx, inbound_rx) = line_channel();
        let runner = TransportRunner::new(transport, self.config.runner.clone());

        let span = tracing::Span::current();
        let worker = tokio::spawn(
            run_worker(
                runner,
                outbound_rx,
                outbound_tx.clone(),
                inbound_tx,
                cancel.clone(),
                Arc::clone(&self.shared),
            )
            .instrument(span.clone()),
        );
        let relay = tokio::spawn(
            run_relay(inbound_rx, cancel.clone(), Arc::clone(&self.shared)).instrument(span),
        );

        let sink = MessageSink {
            outbound: outbound_tx.clone(),
        };
        *session = Some(LiveSession {
            cancel,
            outbound: outbound_tx,
            worker,
            relay,
        });
        drop(session);

        // The host may call back into the bridge from either callback.
        self.shared.host.install_sink(sink);
        debug!("transport bridge started");
        self.shared.host.ready_to_send();
        Ok(())
    }

    /// The host acknowledged the remote side closed; finish gracefully
    ///
    /// # Errors
    ///
    /// [`ForgeError::NotStarted`] if [`start`](Self::start) never succeeded.
    pub fn notify_closed(&self) -> ForgeResult<()> {
        let session = self.session();
        let live = session.as_ref().ok_or(ForgeError::NotStarted)?;

        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.shared.transition(
            &[BridgeState::Opening, BridgeState::Running],
            BridgeState::Closing,
        );
        live.outbound.complete();
        Ok(())
    }

    /// The host asks to close the connection
    ///
    /// Once data has been received the sink stays open so the host can run
    /// its own close exchange, which ends with
    /// [`notify_closed`](Self::notify_closed). Closing before anything was
    /// received is abnormal: the session is cancelled rather than waiting on
    /// a transport that never answered.
    ///
    /// # Errors
    ///
    /// [`ForgeError::NotStarted`] if [`start`](Self::start) never succeeded.
    pub fn close(&self) -> ForgeResult<()> {
        let session = self.session();
        let live = session.as_ref().ok_or(ForgeError::NotStarted)?;

        if !self.has_read() {
            debug!(session = %self.shared.id, "closing before any data was read, cancelling");
            self.shared.close_requested.store(true, Ordering::SeqCst);
            live.cancel.cancel();
            live.outbound.complete();
        }
        self.shared.transition(
            &[BridgeState::Opening, BridgeState::Running],
            BridgeState::Closing,
        );
        Ok(())
    }

    /// Wait until the session is established
    ///
    /// Resolves once the first line arrives. A session that faults first
    /// returns the fault; one that is closed first returns
    /// [`TransportError::Cancelled`].
    pub async fn wait_running(&self) -> ForgeResult<()> {
        let mut rx = self.subscribe();
        let state = match rx
            .wait_for(|state| !matches!(state, BridgeState::Idle | BridgeState::Opening))
            .await
        {
            Ok(state) => *state,
            Err(_) => return Err(ForgeError::NotStarted),
        };

        match state {
            BridgeState::Running => Ok(()),
            BridgeState::Faulted => Err(ForgeError::Transport(
                self.fault().unwrap_or(TransportError::ClosedUnexpectedly),
            )),
            _ if self.has_read() => Ok(()),
            _ => Err(ForgeError::Transport(TransportError::Cancelled)),
        }
    }

    /// Tear the session down
    ///
    /// Cancels unless the host already closed, then waits for the background
    /// work up to [`BridgeConfig::dispose_timeout`]. Calling it again, or on a
    /// bridge that never started, is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ForgeError::TeardownTimedOut`] if the background work did not stop
    /// - a transport failure that happened after the host asked to close and
    ///   was therefore not reported through [`HostEngine::report_error`]
    #[tracing::instrument(
        name = "bridge_dispose",
        skip(self),
        fields(session = %self.shared.id, transport = %self.descriptor.transport_string())
    )]
    pub async fn dispose(&self) -> ForgeResult<()> {
        let Some(mut live) = self.session().take() else {
            self.shared.transition(&[BridgeState::Idle], BridgeState::Closed);
            return Ok(());
        };

        if !self.shared.close_requested.load(Ordering::SeqCst) {
            live.cancel.cancel();
        }

        let result = match timeout(self.config.dispose_timeout, &mut live.worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("transport worker panicked: {}", e);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "transport worker did not stop within {:?}, aborting",
                    self.config.dispose_timeout
                );
                live.cancel.cancel();
                live.worker.abort();
                Err(ForgeError::TeardownTimedOut(self.config.dispose_timeout))
            }
        };

        // Inbound is complete once the worker is done; let the relay drain it.
        if timeout(self.config.runner.error_grace, &mut live.relay)
            .await
            .is_err()
        {
            live.relay.abort();
        }

        self.shared.transition(
            &[
                BridgeState::Idle,
                BridgeState::Opening,
                BridgeState::Running,
                BridgeState::Closing,
            ],
            BridgeState::Closed,
        );
        debug!(state = ?self.state(), "transport bridge disposed");
        result
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        if let Some(live) = self.session().as_ref() {
            live.cancel.cancel();
        }
    }
}

/// Runs the transport and reports how it ended
async fn run_worker(
    runner: TransportRunner,
    outbound_rx: LineReceiver,
    outbound_tx: LineSender,
    inbound_tx: LineSender,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) -> ForgeResult<()> {
    let result = runner.run(outbound_rx, inbound_tx, cancel).await;

    // Completing outbound first means the host never asked to close.
    let first = outbound_tx.complete();

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) if first => {
            shared.fault(e);
            Ok(())
        }
        Err(_) if shared.reported.load(Ordering::SeqCst) => Ok(()),
        Err(e) => {
            debug!(error = %e, "transport failed after close was requested");
            Err(ForgeError::Transport(e))
        }
    }
}

/// Delivers inbound lines to the host in order
async fn run_relay(mut inbound: LineReceiver, cancel: CancellationToken, shared: Arc<Shared>) {
    let mut lines = 0usize;
    loop {
        match inbound.recv().await {
            Ok(Some(line)) => {
                if !shared.has_read.swap(true, Ordering::SeqCst) {
                    shared.transition(&[BridgeState::Opening], BridgeState::Running);
                }
                lines += 1;
                shared.host.deliver_line(line);
            }
            Ok(None) => {
                if !cancel.is_cancelled() && !shared.close_requested.load(Ordering::SeqCst) {
                    shared.fault(TransportError::ClosedUnexpectedly);
                }
                break;
            }
            Err(e) => {
                if !shared.close_requested.load(Ordering::SeqCst) {
                    shared.fault(e);
                }
                break;
            }
        }
    }
    debug!(lines, "transport relay finished");
}
