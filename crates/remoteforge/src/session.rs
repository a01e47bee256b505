//! Opening several targets at once
//!
//! Each connection string is resolved, bridged to its own host engine and
//! started concurrently. A target counts as open once its first line
//! arrives.

use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::{BridgeConfig, HostEngine, TransportBridge};
use crate::descriptor::BoxedDescriptor;
use crate::error::{ForgeError, ForgeResult};

/// A started session for one target
pub struct OpenedSession {
    /// The connection string as supplied
    pub target: String,
    /// The running bridge
    pub bridge: TransportBridge,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("target", &self.target)
            .field("id", &self.bridge.id())
            .field("state", &self.bridge.state())
            .finish()
    }
}

/// Open every target concurrently
///
/// `resolve` turns a connection string into a descriptor (usually
/// [`SchemeRegistry::resolve`](crate::SchemeRegistry::resolve) or
/// [`ContextRegistryStore::resolve`](crate::ContextRegistryStore::resolve)),
/// and `host_for` supplies the host engine for each target.
///
/// Returns one result per target in input order. Failures are
/// [`ForgeError::OpenFailed`] tagged with the original connection string.
/// Targets still opening when `cancel` fires are disposed and left out.
pub async fn open_all<I, S, R, H>(
    targets: I,
    resolve: R,
    host_for: H,
    config: &BridgeConfig,
    cancel: &CancellationToken,
) -> Vec<ForgeResult<OpenedSession>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    R: Fn(&str) -> ForgeResult<BoxedDescriptor>,
    H: Fn(&str) -> Arc<dyn HostEngine>,
{
    let resolve = &resolve;
    let host_for = &host_for;

    let opening = targets.into_iter().map(|target| {
        let target: String = target.into();
        async move {
            open_one(&target, resolve, host_for, config, cancel)
                .await
                .map(|bridge| OpenedSession {
                    target: target.clone(),
                    bridge,
                })
                .map_err(|e| ForgeError::open_failed(target, e))
        }
    });

    join_all(opening)
        .await
        .into_iter()
        .filter(|result| !matches!(result, Err(e) if e.is_cancelled()))
        .collect()
}

async fn open_one<R, H>(
    target: &str,
    resolve: &R,
    host_for: &H,
    config: &BridgeConfig,
    cancel: &CancellationToken,
) -> ForgeResult<TransportBridge>
where
    R: Fn(&str) -> ForgeResult<BoxedDescriptor>,
    H: Fn(&str) -> Arc<dyn HostEngine>,
{
    let descriptor = resolve(target)?;
    let bridge = TransportBridge::new(descriptor, host_for(target), config.clone());
    bridge.start()?;

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ForgeError::Transport(
            remoteforge_transport::TransportError::Cancelled,
        )),
        result = bridge.wait_running() => result,
    };

    match opened {
        Ok(()) => {
            debug!(target, session = %bridge.id(), "target opened");
            Ok(bridge)
        }
        Err(e) => {
            if let Err(dispose_err) = bridge.dispose().await {
                debug!(target, error = %dispose_err, "dispose after failed open");
            }
            Err(e)
        }
    }
}
