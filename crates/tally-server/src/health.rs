//! `/health` and `/ready` endpoint bodies.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered WebSocket connections.
    pub connections: usize,
}

/// Readiness response body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// `false` once shutdown has begun.
    pub ready: bool,
    /// Registered WebSocket connections, while ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

/// Build a readiness response.
pub fn readiness_check(shutting_down: bool, connections: usize) -> ReadinessResponse {
    if shutting_down {
        ReadinessResponse {
            ready: false,
            connections: None,
        }
    } else {
        ReadinessResponse {
            ready: true,
            connections: Some(connections),
        }
    }
}
