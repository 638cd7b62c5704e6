//! Per-connection state machine: accept → message loop → disconnect.

use std::sync::Arc;

use tally_core::SessionId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, OutboundFrame};
use super::protocol::{ConnectAck, EXIT_COMMAND, Farewell, MessageAck, NORMAL_CLOSURE};
use super::registry::ConnectionRegistry;
use crate::metrics::MetricsSink;
use crate::session_store::{SavedSession, SessionStore};

/// Shared collaborators every handler needs.
#[derive(Clone)]
pub struct HandlerContext {
    /// Resumable session state.
    pub sessions: Arc<SessionStore>,
    /// Live connection set.
    pub registry: Arc<ConnectionRegistry>,
    /// Observability sink.
    pub metrics: Arc<dyn MetricsSink>,
}

impl HandlerContext {
    /// Bundle the collaborators.
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            sessions,
            registry,
            metrics,
        }
    }
}

/// Lifecycle of a handled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, acknowledgement not yet sent.
    Connecting,
    /// Registered and processing frames.
    Open,
    /// Exit requested; close frame queued.
    Closing,
    /// Disconnect cleanup done.
    Closed,
}

/// What the caller should do after a frame was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep reading frames.
    Continue,
    /// The client asked to leave; stop reading.
    Exit,
}

/// Drives one connection through its lifecycle.
pub struct ConnectionHandler {
    ctx: HandlerContext,
    connection: Arc<Connection>,
    resumed: bool,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Accept a connection.
    ///
    /// Resolves the session id (generating one if none was requested),
    /// restores any saved count, sends the acknowledgement and registers the
    /// connection. This is the only place a session is resumed.
    pub async fn accept(
        ctx: HandlerContext,
        requested: Option<SessionId>,
        tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let session_id = requested.unwrap_or_default();
        let saved = ctx.sessions.get(&session_id);
        let resumed = saved.is_some();
        let count = saved.map_or(0, |s| s.count);

        let connection = Arc::new(Connection::new(session_id.clone(), count, tx));
        let mut handler = Self {
            ctx,
            connection,
            resumed,
            state: ConnectionState::Connecting,
        };

        let ack = ConnectAck {
            session_id: session_id.clone(),
            resumed,
            count,
        };
        if let Err(e) = handler.connection.send_wait(&ack).await {
            warn!(conn_id = %handler.connection.id, error = %e, "failed to send connect ack");
        }

        let _ = handler.ctx.registry.register(Arc::clone(&handler.connection));
        handler.state = ConnectionState::Open;
        handler.ctx.metrics.increment_connections();
        handler
            .ctx
            .metrics
            .set_active_connections(handler.ctx.registry.size());
        info!(
            conn_id = %handler.connection.id,
            %session_id,
            resumed,
            count,
            "client connected"
        );
        handler
    }

    /// The managed connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether saved state was restored on accept.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one inbound application frame.
    ///
    /// [`EXIT_COMMAND`] sends the farewell, closes with a normal-closure code
    /// and runs disconnect cleanup. Any other text counts one message.
    pub async fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        if self.state != ConnectionState::Open {
            return FrameOutcome::Exit;
        }
        if text == EXIT_COMMAND {
            self.exit();
            return FrameOutcome::Exit;
        }

        let started = Instant::now();
        let guard = self.connection.begin_message();
        if self.connection.is_closing() {
            return FrameOutcome::Exit;
        }
        let Some(count) = self.connection.try_increment_count() else {
            return FrameOutcome::Exit;
        };
        self.ctx.metrics.increment_messages();
        if let Err(e) = self.connection.send_wait(&MessageAck { count }).await {
            debug!(conn_id = %self.connection.id, error = %e, "failed to send message ack");
        }
        drop(guard);
        self.ctx
            .metrics
            .record_message_processing_duration(started.elapsed().as_secs_f64());
        FrameOutcome::Continue
    }

    fn exit(&mut self) {
        let total = self.connection.seal_count();
        if let Err(e) = self.connection.send_json(&Farewell::new(total)) {
            debug!(conn_id = %self.connection.id, error = %e, "failed to send farewell");
        }
        self.state = ConnectionState::Closing;
        if let Err(e) = self.connection.close(NORMAL_CLOSURE) {
            debug!(conn_id = %self.connection.id, error = %e, "failed to queue close frame");
        }
        self.disconnect();
    }

    /// Disconnect cleanup: save the session, deregister, mark closed.
    ///
    /// Safe to call more than once; only the first call has any effect.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        let total = self.connection.message_count();
        self.ctx.sessions.set(
            self.connection.session_id().clone(),
            SavedSession { count: total },
        );
        let _ = self.ctx.registry.deregister(&self.connection.id);
        let _ = self.connection.mark_closed();

        self.ctx.metrics.increment_disconnections();
        self.ctx
            .metrics
            .set_active_connections(self.ctx.registry.size());
        info!(
            conn_id = %self.connection.id,
            session_id = %self.connection.session_id(),
            total,
            duration_ms = u64::try_from(self.connection.connected_at.elapsed().as_millis())
                .unwrap_or(u64::MAX),
            "client disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::{RecordingSink, read};
    use std::time::Duration;

    struct Harness {
        ctx: HandlerContext,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = Arc::new(RecordingSink::default());
            let ctx = HandlerContext::new(
                Arc::new(SessionStore::default()),
                Arc::new(ConnectionRegistry::new()),
                Arc::clone(&sink) as Arc<dyn MetricsSink>,
            );
            Self { ctx, sink }
        }

        async fn accept(
            &self,
            session: Option<&str>,
        ) -> (ConnectionHandler, mpsc::Receiver<OutboundFrame>) {
            let (tx, rx) = mpsc::channel(16);
            let handler =
                ConnectionHandler::accept(self.ctx.clone(), session.map(SessionId::from), tx).await;
            (handler, rx)
        }
    }

    async fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> serde_json::Value {
        match rx.recv().await.unwrap() {
            OutboundFrame::Text(t) => serde_json::from_str(&t).unwrap(),
            OutboundFrame::Close(code) => panic!("unexpected close {code}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_without_header_starts_fresh() {
        let h = Harness::new();
        let (handler, mut rx) = h.accept(None).await;

        let ack = next_json(&mut rx).await;
        assert_eq!(ack["resumed"], false);
        assert_eq!(ack["count"], 0);
        let sid = ack["sessionId"].as_str().unwrap();
        assert!(!sid.is_empty());
        assert_eq!(sid, handler.connection().session_id().as_str());

        assert_eq!(handler.state(), ConnectionState::Open);
        assert!(h.ctx.registry.contains(&handler.connection().id));
        assert_eq!(read(&h.sink.connections), 1);
        assert_eq!(h.sink.active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_increment_and_ack() {
        let h = Harness::new();
        let (mut handler, mut rx) = h.accept(Some("s1")).await;
        let _ = next_json(&mut rx).await;

        for expected in 1..=3 {
            assert_eq!(handler.handle_frame("hello").await, FrameOutcome::Continue);
            assert_eq!(next_json(&mut rx).await["count"], expected);
        }
        assert_eq!(handler.connection().in_flight(), 0);
        assert_eq!(read(&h.sink.messages), 3);
        assert_eq!(h.sink.durations.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_within_ttl() {
        let h = Harness::new();
        let (mut first, mut rx) = h.accept(Some("s1")).await;
        let _ = next_json(&mut rx).await;
        for _ in 0..7 {
            let _ = first.handle_frame("x").await;
        }
        first.disconnect();

        tokio::time::advance(Duration::from_secs(120)).await;
        let (second, mut rx) = h.accept(Some("s1")).await;
        let ack = next_json(&mut rx).await;
        assert_eq!(ack["sessionId"], "s1");
        assert_eq!(ack["resumed"], true);
        assert_eq!(ack["count"], 7);
        assert!(second.resumed());
        assert_eq!(second.connection().message_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_ttl_starts_fresh() {
        let h = Harness::new();
        let (mut first, _rx) = h.accept(Some("s1")).await;
        for _ in 0..7 {
            let _ = first.handle_frame("x").await;
        }
        first.disconnect();

        tokio::time::advance(Duration::from_secs(301)).await;
        let (second, mut rx) = h.accept(Some("s1")).await;
        let ack = next_json(&mut rx).await;
        assert_eq!(ack["resumed"], false);
        assert_eq!(ack["count"], 0);
        assert!(!second.resumed());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_sends_farewell_closes_and_deregisters() {
        let h = Harness::new();
        let (mut handler, mut rx) = h.accept(Some("s1")).await;
        let _ = next_json(&mut rx).await;
        for _ in 0..3 {
            let _ = handler.handle_frame("x").await;
            let _ = next_json(&mut rx).await;
        }

        assert_eq!(handler.handle_frame("exit").await, FrameOutcome::Exit);
        assert_eq!(next_json(&mut rx).await, serde_json::json!({"bye": true, "total": 3}));
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Close(NORMAL_CLOSURE));

        assert!(!h.ctx.registry.contains(&handler.connection().id));
        assert_eq!(h.ctx.registry.size(), 0);
        assert!(handler.connection().is_closed());
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert_eq!(
            h.ctx.sessions.get(&SessionId::from("s1")),
            Some(SavedSession { count: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exit_is_matched_exactly() {
        let h = Harness::new();
        let (mut handler, _rx) = h.accept(None).await;
        assert_eq!(handler.handle_frame("EXIT").await, FrameOutcome::Continue);
        assert_eq!(handler.handle_frame(" exit").await, FrameOutcome::Continue);
        assert_eq!(handler.connection().message_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let h = Harness::new();
        let (mut handler, _rx) = h.accept(Some("s1")).await;
        let _ = handler.handle_frame("x").await;
        handler.disconnect();

        // a later session write must not be clobbered by a second cleanup
        h.ctx.sessions.set(SessionId::from("s1"), SavedSession { count: 42 });
        handler.disconnect();

        assert_eq!(read(&h.sink.disconnections), 1);
        assert_eq!(
            h.ctx.sessions.get(&SessionId::from("s1")),
            Some(SavedSession { count: 42 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_does_not_crash_and_releases_in_flight() {
        let h = Harness::new();
        let (mut handler, rx) = h.accept(None).await;
        drop(rx);
        assert_eq!(handler.handle_frame("x").await, FrameOutcome::Continue);
        assert_eq!(handler.connection().message_count(), 1);
        assert_eq!(handler.connection().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_after_close_are_ignored() {
        let h = Harness::new();
        let (mut handler, _rx) = h.accept(None).await;
        handler.disconnect();
        assert_eq!(handler.handle_frame("x").await, FrameOutcome::Exit);
        assert_eq!(handler.connection().message_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_after_farewell_is_not_counted() {
        let h = Harness::new();
        let (mut handler, mut rx) = h.accept(Some("s1")).await;
        let _ = next_json(&mut rx).await;
        let _ = handler.handle_frame("x").await;
        let _ = handler.handle_frame("x").await;

        // the drain reports its total before the connection is cancelled
        assert_eq!(handler.connection().seal_count(), 2);
        assert_eq!(handler.handle_frame("late").await, FrameOutcome::Exit);
        assert_eq!(handler.connection().message_count(), 2);
        assert_eq!(handler.connection().in_flight(), 0);

        handler.disconnect();
        assert_eq!(
            h.ctx.sessions.get(&SessionId::from("s1")),
            Some(SavedSession { count: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frame_after_close_request_is_not_counted() {
        let h = Harness::new();
        let (mut handler, _rx) = h.accept(None).await;
        let _ = handler.handle_frame("x").await;
        handler.connection().abort();
        assert_eq!(handler.handle_frame("x").await, FrameOutcome::Exit);
        assert_eq!(handler.connection().message_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reconnects_last_write_wins() {
        let h = Harness::new();
        let (mut a, _rx_a) = h.accept(Some("shared")).await;
        let (mut b, _rx_b) = h.accept(Some("shared")).await;
        assert_eq!(h.ctx.registry.size(), 2);

        let _ = a.handle_frame("x").await;
        for _ in 0..4 {
            let _ = b.handle_frame("x").await;
        }
        b.disconnect();
        a.disconnect();

        assert_eq!(
            h.ctx.sessions.get(&SessionId::from("shared")),
            Some(SavedSession { count: 1 })
        );
    }
}
