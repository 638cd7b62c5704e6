//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::connection::Connection;
use crate::websocket::protocol::{Farewell, NORMAL_CLOSURE};
use crate::websocket::registry::ConnectionRegistry;

/// Default timeout for joining background tasks before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the drain waits for a connection's in-flight work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Delay between in-flight checks.
    pub poll_interval: Duration,
    /// Checks before the connection is closed anyway.
    pub max_attempts: u32,
}

impl DrainPolicy {
    /// Longest time a single connection is waited on.
    pub fn ceiling(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_attempts: 100,
        }
    }
}

/// How draining one connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// In-flight work finished; farewell sent and close queued.
    Closed,
    /// In-flight work never finished; closed anyway.
    ForceClosed,
    /// The handler had already run its disconnect cleanup.
    AlreadyClosed,
    /// The close frame could not be queued.
    Failed,
}

/// Tally of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections in the snapshot.
    pub attempted: usize,
    /// Closed after their work finished.
    pub closed: usize,
    /// Closed after the wait ran out.
    pub force_closed: usize,
    /// Skipped because they were already closed.
    pub already_closed: usize,
    /// Close could not be queued.
    pub failed: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: DrainOutcome) {
        match outcome {
            DrainOutcome::Closed => self.closed += 1,
            DrainOutcome::ForceClosed => self.force_closed += 1,
            DrainOutcome::AlreadyClosed => self.already_closed += 1,
            DrainOutcome::Failed => self.failed += 1,
        }
    }
}

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    policy: DrainPolicy,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with the default drain policy.
    pub fn new() -> Self {
        Self::with_policy(DrainPolicy::default())
    }

    /// Create a coordinator with a custom drain policy.
    pub fn with_policy(policy: DrainPolicy) -> Self {
        Self {
            token: CancellationToken::new(),
            policy,
        }
    }

    /// Drain policy in use.
    pub fn policy(&self) -> DrainPolicy {
        self.policy
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

    /// Drain every connection in a snapshot of `registry`.
    ///
    /// Each connection is waited on until its in-flight count reaches zero or
    /// the policy runs out, then sent a farewell and closed unless its handler
    /// already closed it. Connections are drained concurrently; a failure on
    /// one is logged and never stops the others. Returns once every
    /// connection in the snapshot was attempted.
    pub async fn drain(&self, registry: &ConnectionRegistry) -> DrainReport {
        let snapshot = registry.snapshot();
        let mut report = DrainReport {
            attempted: snapshot.len(),
            ..DrainReport::default()
        };
        info!(connections = snapshot.len(), "draining connections");

        let outcomes =
            futures::future::join_all(snapshot.into_iter().map(|c| drain_one(c, self.policy)))
                .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            attempted = report.attempted,
            closed = report.closed,
            force_closed = report.force_closed,
            already_closed = report.already_closed,
            failed = report.failed,
            "drain complete"
        );
        report
    }

    /// Perform a graceful shutdown of all tracked tasks.
    ///
    /// 1. Cancel the shutdown token (signals all tasks)
    /// 2. Wait up to `timeout` for all handles to complete
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let join = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }

    /// Full shutdown sequence: stop accepting work, drain connections, then
    /// join the background tasks.
    pub async fn run(
        &self,
        registry: &ConnectionRegistry,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> DrainReport {
        self.shutdown();
        let report = self.drain(registry).await;
        self.graceful_shutdown(handles, timeout).await;
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_one(conn: Arc<Connection>, policy: DrainPolicy) -> DrainOutcome {
    let idle = wait_for_idle(&conn, policy).await;
    if !idle {
        warn!(
            conn_id = %conn.id,
            in_flight = conn.in_flight(),
            waited_ms = u64::try_from(policy.ceiling().as_millis()).unwrap_or(u64::MAX),
            "in-flight work did not finish, closing anyway"
        );
    }

    if conn.is_closed() {
        debug!(conn_id = %conn.id, "already closed, skipping");
        return DrainOutcome::AlreadyClosed;
    }

    let total = conn.seal_count();
    if let Err(e) = conn.send_json(&Farewell::new(total)) {
        warn!(conn_id = %conn.id, error = %e, "failed to send farewell");
    }
    if let Err(e) = conn.close(NORMAL_CLOSURE) {
        warn!(conn_id = %conn.id, error = %e, "failed to close connection");
        return DrainOutcome::Failed;
    }

    if idle {
        DrainOutcome::Closed
    } else {
        DrainOutcome::ForceClosed
    }
}

/// Poll the in-flight count. Returns `true` once it is zero, `false` if it
/// never was within the policy.
async fn wait_for_idle(conn: &Connection, policy: DrainPolicy) -> bool {
    for _ in 0..policy.max_attempts {
        if conn.in_flight() == 0 {
            return true;
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
    conn.in_flight() == 0
}
