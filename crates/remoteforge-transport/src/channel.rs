//! Completable line queues
//!
//! An unbounded, ordered queue of text lines that can be marked complete,
//! either cleanly or with an error. Completion is first-wins: once a queue
//! is complete, further sends fail with [`TransportError::Closed`] rather
//! than being dropped, and later completions are ignored.
//!
//! Lines travel over a tokio unbounded mpsc channel; the completion sits
//! next to it and a [`CancellationToken`] wakes the consumer when it is set.
//!
//! Two of these make up the [`DuplexChannels`] pair the runner exposes.

use crate::error::{Result, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Completion {
    Complete,
    Failed(TransportError),
}

#[derive(Debug)]
struct Shared {
    completion: Mutex<Option<Completion>>,
    completed: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Completion>> {
        self.completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, completion: Completion) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(completion);
        self.completed.cancel();
        true
    }
}

/// Create a new line queue
///
/// The sender may be cloned for many producers; the receiver is the single
/// consumer. Dropping the last sender completes the queue cleanly, dropping
/// the receiver makes later sends fail.
pub fn line_channel() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        completion: Mutex::new(None),
        completed: CancellationToken::new(),
    });

    (
        LineSender {
            tx,
            shared: Arc::clone(&shared),
        },
        LineReceiver { rx, shared },
    )
}

/// Producer side of a line queue
#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl LineSender {
    /// Push a line onto the queue
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the queue has been completed.
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        // Held across the send so no line lands after the completion
        let completion = self.shared.lock();
        if completion.is_some() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(line.into())
            .map_err(|_| TransportError::Closed)
    }

    /// Mark the queue complete
    ///
    /// Lines already queued are still delivered. Returns `false` if the
    /// queue was already complete.
    pub fn complete(&self) -> bool {
        self.shared.finish(Completion::Complete)
    }

    /// Mark the queue complete with an error
    ///
    /// The consumer receives the queued lines first, then the error.
    /// Returns `false` if the queue was already complete.
    pub fn fail(&self, error: TransportError) -> bool {
        self.shared.finish(Completion::Failed(error))
    }

    /// Whether the queue has been completed or its receiver dropped
    pub fn is_completed(&self) -> bool {
        self.shared.lock().is_some() || self.tx.is_closed()
    }

    /// The error the queue was failed with, if any
    pub fn failure(&self) -> Option<TransportError> {
        match &*self.shared.lock() {
            Some(Completion::Failed(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

/// Consumer side of a line queue
#[derive(Debug)]
pub struct LineReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
}

impl LineReceiver {
    /// Receive the next line
    ///
    /// Returns `Ok(Some(line))` while lines are queued, `Ok(None)` once the
    /// queue completed cleanly and is drained, and the completion error once
    /// it failed and is drained.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        tokio::select! {
            biased;
            line = self.rx.recv() => match line {
                Some(line) => Ok(Some(line)),
                None => self.finished(),
            },
            _ = self.shared.completed.cancelled() => match self.rx.try_recv() {
                Ok(line) => Ok(Some(line)),
                Err(_) => self.finished(),
            },
        }
    }

    fn finished(&self) -> Result<Option<String>> {
        match &*self.shared.lock() {
            Some(Completion::Failed(err)) => Err(err.clone()),
            _ => Ok(None),
        }
    }

    /// Whether the producer side has completed the queue
    pub fn is_completed(&self) -> bool {
        self.shared.lock().is_some() || self.rx.is_closed()
    }
}

impl Drop for LineReceiver {
    fn drop(&mut self) {
        self.shared.finish(Completion::Complete);
    }
}

/// The two queues between a caller and a running transport
#[derive(Debug)]
pub struct DuplexChannels {
    /// Lines to write to the transport
    pub outbound: LineSender,
    /// Lines read from the transport
    pub inbound: LineReceiver,
}
