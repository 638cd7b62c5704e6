//! Observability sink and Prometheus recorder.
//!
//! The core reports through [`MetricsSink`] and never reads metrics back.
//! [`PrometheusSink`] forwards to the global `metrics` recorder installed by
//! [`install_recorder`]; without a recorder the calls are no-ops.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections cleaned up (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Registered WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Application messages processed (counter).
pub const WS_MESSAGES_TOTAL: &str = "ws_messages_total";
/// Heartbeat frames delivered to the send queue (counter).
pub const WS_HEARTBEAT_PINGS_TOTAL: &str = "ws_heartbeat_pings_total";
/// Heartbeat sends that failed and pruned a connection (counter).
pub const WS_HEARTBEAT_FAILURES_TOTAL: &str = "ws_heartbeat_failures_total";
/// Per-message processing latency (histogram, seconds).
pub const WS_MESSAGE_PROCESSING_DURATION_SECONDS: &str = "ws_message_processing_duration_seconds";

/// Write-only counters and gauges the connection core reports into.
pub trait MetricsSink: Send + Sync {
    /// A connection was accepted.
    fn increment_connections(&self);
    /// A connection finished its disconnect cleanup.
    fn increment_disconnections(&self);
    /// Current registry size.
    fn set_active_connections(&self, count: usize);
    /// One application message was processed.
    fn increment_messages(&self);
    /// One heartbeat frame was queued successfully.
    fn increment_heartbeat_pings(&self);
    /// One heartbeat send failed.
    fn increment_heartbeat_failures(&self);
    /// Time spent handling one application message.
    fn record_message_processing_duration(&self, seconds: f64);
}

/// [`MetricsSink`] backed by the `metrics` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn increment_connections(&self) {
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
    }

    fn increment_disconnections(&self) {
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_active_connections(&self, count: usize) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(count as f64);
    }

    fn increment_messages(&self) {
        counter!(WS_MESSAGES_TOTAL).increment(1);
    }

    fn increment_heartbeat_pings(&self) {
        counter!(WS_HEARTBEAT_PINGS_TOTAL).increment(1);
    }

    fn increment_heartbeat_failures(&self) {
        counter!(WS_HEARTBEAT_FAILURES_TOTAL).increment(1);
    }

    fn record_message_processing_duration(&self, seconds: f64) {
        histogram!(WS_MESSAGE_PROCESSING_DURATION_SECONDS).record(seconds);
    }
}

/// Install the Prometheus recorder globally.
///
/// Returns the handle that renders the `/metrics` endpoint. Fails if a global
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::MetricsSink;

    /// Sink that records every call for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub connections: AtomicU64,
        pub disconnections: AtomicU64,
        pub active: AtomicUsize,
        pub messages: AtomicU64,
        pub pings: AtomicU64,
        pub ping_failures: AtomicU64,
        pub durations: Mutex<Vec<f64>>,
    }

    impl RecordingSink {
        pub(crate) fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }
    }

    /// Read a recorded counter.
    pub(crate) fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    impl MetricsSink for RecordingSink {
        fn increment_connections(&self) {
            let _ = self.connections.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_disconnections(&self) {
            let _ = self.disconnections.fetch_add(1, Ordering::SeqCst);
        }
        fn set_active_connections(&self, count: usize) {
            self.active.store(count, Ordering::SeqCst);
        }
        fn increment_messages(&self) {
            let _ = self.messages.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_heartbeat_pings(&self) {
            let _ = self.pings.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_heartbeat_failures(&self) {
            let _ = self.ping_failures.fetch_add(1, Ordering::SeqCst);
        }
        fn record_message_processing_duration(&self, seconds: f64) {
            self.durations.lock().push(seconds);
        }
    }
}
