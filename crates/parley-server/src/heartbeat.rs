//! Idle-session reaping.
//!
//! Clients prove liveness with `heartbeat` frames (or any other frame, or a
//! pong to the writer's pings). Sessions quiet for longer than the idle
//! timeout are closed with `idle_timeout` and evicted from the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::ConnectionRegistry;

/// Outcome of the reaper loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The loop was cancelled externally. Carries the total sessions reaped.
    Cancelled { reaped: usize },
}

/// Sweep the registry every `interval`, closing sessions idle for longer
/// than `timeout`.
pub async fn run_idle_reaper(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;
    let mut reaped = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = registry.reap_idle(timeout);
                if removed > 0 {
                    info!(removed, remaining = registry.count(), "idle sweep");
                    reaped += removed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled { reaped };
            }
        }
    }
}

/// Spawn [`run_idle_reaper`] as a background task.
pub fn start_idle_reaper(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let HeartbeatResult::Cancelled { reaped } =
            run_idle_reaper(registry, interval, timeout, cancel).await;
        tracing::debug!(reaped, "idle reaper stopped");
    })
}
