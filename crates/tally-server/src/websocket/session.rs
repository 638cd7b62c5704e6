//! WebSocket session lifecycle: drives a single upgraded socket from accept
//! through disconnect.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tally_core::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, instrument};

use super::connection::OutboundFrame;
use super::handler::{ConnectionHandler, FrameOutcome, HandlerContext};

/// How long the writer may take to flush queued frames after the reader stops.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a WebSocket session for an upgraded socket.
///
/// 1. Accepts the connection (session resolution, ack, registration)
/// 2. Spawns the outbound writer draining the connection's send queue
/// 3. Feeds inbound text frames to the handler until the peer leaves, the
///    client exits, or the connection is asked to close
/// 4. Runs disconnect cleanup and lets the writer flush
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    requested: Option<SessionId>,
    ctx: HandlerContext,
    send_queue_capacity: usize,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(send_queue_capacity);

    let mut handler = ConnectionHandler::accept(ctx, requested, tx).await;
    let connection = std::sync::Arc::clone(handler.connection());
    let _ = Span::current().record("conn_id", tracing::field::display(&connection.id));

    let mut writer = tokio::spawn(write_outbound(ws_tx, rx, connection.cancel_token()));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = connection.closing() => {
                debug!("close requested");
                break;
            }
        };

        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("peer closed");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "receive failed");
                break;
            }
        };

        if handler.handle_frame(&text).await == FrameOutcome::Exit {
            break;
        }
    }

    handler.disconnect();

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        debug!("writer did not flush in time, aborting");
        writer.abort();
    }
}

/// Forward queued frames to the socket until a close frame is written, the
/// queue closes, or the connection is cancelled. Frames queued before the
/// cancellation are still written.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if !write_frame(&mut sink, frame).await {
                        return;
                    }
                }
                None => return,
            },
            () = cancel.cancelled() => break,
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if !write_frame(&mut sink, frame).await {
            return;
        }
    }
}

/// Write one frame. Returns `false` when the writer should stop.
async fn write_frame(sink: &mut SplitSink<WebSocket, Message>, frame: OutboundFrame) -> bool {
    match frame {
        OutboundFrame::Text(text) => {
            if let Err(e) = sink.send(Message::Text(text.as_str().into())).await {
                debug!(error = %e, "send failed");
                return false;
            }
            true
        }
        OutboundFrame::Close(code) => {
            let close = CloseFrame {
                code,
                reason: Utf8Bytes::from_static(""),
            };
            if let Err(e) = sink.send(Message::Close(Some(close))).await {
                debug!(error = %e, "close failed");
            }
            false
        }
    }
}
