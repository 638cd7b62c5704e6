//! Periodic liveness sweep over the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::encode;
use super::protocol::Heartbeat;
use super::registry::ConnectionRegistry;
use crate::metrics::MetricsSink;

/// Default period between sweeps.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections in the snapshot.
    pub attempted: usize,
    /// Heartbeats queued successfully.
    pub succeeded: usize,
    /// Connections removed because their send failed.
    pub pruned: usize,
    /// Registry size after pruning.
    pub active: usize,
}

/// Sends a heartbeat to every registered connection and prunes the ones
/// that cannot take it.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor over `registry`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            interval,
        }
    }

    /// Period between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep.
    ///
    /// A failed send marks the connection stale; it is not retried. Stale
    /// connections are deregistered together after every send was attempted,
    /// and told to stop so their handler runs disconnect cleanup.
    pub fn tick(&self) -> SweepReport {
        let snapshot = self.registry.snapshot();
        let mut report = SweepReport {
            attempted: snapshot.len(),
            ..SweepReport::default()
        };

        let payload = match encode(&Heartbeat::now(snapshot.len())) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode heartbeat");
                report.active = self.registry.size();
                return report;
            }
        };

        let mut stale = Vec::new();
        for conn in snapshot {
            match conn.send_text(Arc::clone(&payload)) {
                Ok(()) => {
                    report.succeeded += 1;
                    self.metrics.increment_heartbeat_pings();
                }
                Err(e) => {
                    debug!(conn_id = %conn.id, error = %e, "heartbeat send failed");
                    self.metrics.increment_heartbeat_failures();
                    stale.push(conn);
                }
            }
        }

        for conn in stale {
            if self.registry.deregister(&conn.id) {
                report.pruned += 1;
                info!(conn_id = %conn.id, session_id = %conn.session_id(), "pruned stale connection");
            }
            conn.abort();
        }

        report.active = self.registry.size();
        self.metrics.set_active_connections(report.active);
        debug!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            pruned = report.pruned,
            active = report.active,
            "heartbeat sweep"
        );
        report
    }

    /// Sweep every interval until `cancel` fires. The first sweep happens one
    /// interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick();
                }
                () = cancel.cancelled() => {
                    debug!("heartbeat monitor stopped");
                    return;
                }
            }
        }
    }
}
