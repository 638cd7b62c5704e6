//! `TallyServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tally_core::SessionId;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::MetricsSink;
use crate::session_store::SessionStore;
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::websocket::handler::HandlerContext;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::protocol::SESSION_HEADER;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Collaborators handed to every connection.
    pub handler: HandlerContext,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, if a recorder is installed.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

/// The main tally server.
pub struct TallyServer {
    config: ServerConfig,
    context: HandlerContext,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
}

impl TallyServer {
    /// Create a new server with fresh registry and session store.
    pub fn new(config: ServerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let context = HandlerContext::new(
            Arc::new(SessionStore::new(config.session_ttl)),
            Arc::new(ConnectionRegistry::new()),
            metrics,
        );
        let shutdown = Arc::new(ShutdownCoordinator::with_policy(config.drain));
        Self {
            config,
            context,
            shutdown,
            start_time: Instant::now(),
            metrics_handle: None,
        }
    }

    /// Attach a Prometheus handle to serve `/metrics`.
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            handler: self.context.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
            send_queue_capacity: self.config.send_queue_capacity,
            max_message_size: self.config.max_message_size,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and start serving.
    ///
    /// The accept loop stops when the shutdown token is cancelled. Returns the
    /// bound address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%local_addr, "tally server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, router, token).await {
                error!(error = %e, "server exited with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Heartbeat monitor over this server's registry.
    pub fn heartbeat(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::clone(&self.context.registry),
            Arc::clone(&self.context.metrics),
            self.config.heartbeat_interval,
        )
    }

    /// Start the heartbeat monitor; it stops with the shutdown token.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        tokio::spawn(self.heartbeat().run(self.shutdown.token()))
    }

    /// Run the shutdown sequence: stop accepting, drain every connection,
    /// then join `handles` within the configured timeout.
    pub async fn shutdown_gracefully(&self, handles: Vec<JoinHandle<()>>) -> DrainReport {
        self.shutdown
            .run(
                &self.context.registry,
                handles,
                Some(self.config.shutdown_timeout),
            )
            .await
    }

    /// Live connection set.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    /// Resumable session store.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.context.sessions
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

/// Session id requested through the `x-session-id` header. An empty value
/// counts as absent. Values that are not UTF-8 are refused rather than
/// decoded lossily, so distinct ids never collapse into one.
fn requested_session(headers: &HeaderMap) -> Result<Option<SessionId>, std::str::Utf8Error> {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(value.as_bytes())?;
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SessionId::from(text)))
    }
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let requested = match requested_session(&headers) {
        Ok(requested) => requested,
        Err(e) => {
            debug!(error = %e, "rejecting non-UTF-8 session header");
            return (StatusCode::BAD_REQUEST, "x-session-id must be UTF-8").into_response();
        }
    };
    let capacity = state.send_queue_capacity;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, requested, state.handler, capacity))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.handler.registry.size();
    Json(health::health_check(state.start_time, connections))
}

/// GET /ready
async fn ready_handler(State(state): State<AppState>) -> Response {
    let resp = health::readiness_check(
        state.shutdown.is_shutting_down(),
        state.handler.registry.size(),
    );
    let status = if resp.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
