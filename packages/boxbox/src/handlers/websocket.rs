use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use session_relay::{ConnectionHandle, Disconnect, Inbound, OutboundReceiver, StreamMode};
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryQuery {
    pub driver_id: Option<String>,
}

/// Live telemetry for one session, optionally narrowed to a driver.
pub async fn telemetry_websocket_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TelemetryQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let mode = StreamMode::Telemetry {
        provider: state.telemetry.clone(),
        driver_id: query.driver_id.filter(|d| !d.is_empty()),
        poll_interval: state.settings.telemetry.poll_interval,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, mode))
}

/// Client-to-client event relay within one session.
pub async fn broadcast_websocket_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, StreamMode::Broadcast))
}

/// Bridge an upgraded socket to the relay until either side goes away.
async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, mode: StreamMode) {
    let (conn, outbound) =
        ConnectionHandle::new(session_id, state.settings.telemetry.send_queue_capacity);
    let conn_id = conn.id();
    let (ws_sender, ws_receiver) = socket.split();

    state.metrics.connection_opened();

    let writer = tokio::spawn(write_frames(ws_sender, outbound, conn.clone()));

    let inbound = Box::pin(ws_receiver.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.to_string()))),
            Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Binary(bytes.to_vec()))),
            Ok(Message::Ping(payload)) => Some(Ok(Inbound::Ping(payload.to_vec()))),
            Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
            Err(e) => Some(Err(e)),
        }
    }));

    let reason = session_relay::serve(state.relay.clone(), conn, inbound, mode).await;
    if matches!(reason, Disconnect::Transport(_) | Disconnect::Panicked) {
        state.metrics.websocket_error();
    }

    match writer.await {
        Ok(true) => {}
        Ok(false) => state.metrics.websocket_error(),
        Err(e) => {
            warn!(conn_id = %conn_id, "WebSocket writer task failed: {}", e);
            state.metrics.websocket_error();
        }
    }

    state.metrics.connection_closed();
    info!(conn_id = %conn_id, reason = %reason, "WebSocket disconnected");
}

/// Drain the outbound queue into the socket. Returns false if the sink failed.
async fn write_frames<S>(mut sink: S, mut outbound: OutboundReceiver, conn: ConnectionHandle) -> bool
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                    conn.fail(&e.to_string());
                    return false;
                }
            }
        }
    }

    // Flush whatever was queued before the close, then say goodbye
    while let Ok(frame) = outbound.try_recv() {
        if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
            debug!(conn_id = %conn.id(), "Flush after close failed: {}", e);
            return false;
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(conn_id = %conn.id(), "Close frame not sent: {}", e);
    }
    true
}
