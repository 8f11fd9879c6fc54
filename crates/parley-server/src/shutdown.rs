//! Graceful shutdown: stop accepting work, close live sessions with
//! `server_shutdown`, then wait a bounded time for background tasks.

use std::sync::Arc;
use std::time::Duration;

use parley_core::protocol::CloseReason;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the listener, dispatcher, reaper and pre-auth
    /// connections.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every session, cancel the token and wait up to `timeout` for
    /// `handles`.
    pub async fn graceful_shutdown(
        &self,
        registry: &Arc<ConnectionRegistry>,
        handles: Vec<JoinHandle<()>>,
        timeout: Duration,
    ) {
        info!(sessions = registry.count(), tasks = handles.len(), "shutting down");
        registry.close_all(CloseReason::ServerShutdown);
        self.token.cancel();

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(?timeout, "shutdown timed out, some tasks may still be running");
        }
    }
}
