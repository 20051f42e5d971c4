//! Graceful shutdown coordination via `CancellationToken`.
//!
//! On shutdown every connected client first receives a `disconnect` frame
//! with the `serverShutdown` reason, so well-behaved clients stop
//! reconnecting until the server is back.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hail_core::protocol::{DisconnectPayload, DisconnectReason, Event};

use crate::connections::ConnectionTable;

/// Default timeout for graceful shutdown before force-exiting.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Perform a graceful shutdown.
    ///
    /// 1. Announce `disconnect` (`serverShutdown`) to every client
    /// 2. Cancel the shutdown token (signals all tasks)
    /// 3. Wait up to `timeout` for all handles to complete
    pub async fn graceful_shutdown(
        &self,
        connections: &ConnectionTable,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        connections
            .broadcast(&Event::Disconnect(DisconnectPayload {
                reason: DisconnectReason::ServerShutdown,
            }))
            .await;
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
