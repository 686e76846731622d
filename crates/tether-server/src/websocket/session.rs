//! `WebSocket` session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_core::StatusProjection;
use tether_session::{Caller, Subscriber};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::frames::{snapshot_frame, update_frame};
use super::rpc::handle_message;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// Outbound queue depth per client.
const SEND_BUFFER: usize = 256;

/// Run a status stream for a connected client.
///
/// 1. Sends the `status.snapshot` frame
/// 2. Forwards every published update for the identity
/// 3. Answers RPC frames
/// 4. Pings periodically and drops clients that stop answering
/// 5. Unsubscribes on disconnect or server shutdown
#[instrument(skip_all, fields(identity = %subscriber.identity(), user = %caller.user_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    state: AppState,
    caller: Caller,
    snapshot: StatusProjection,
    mut subscriber: Subscriber,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<String>(SEND_BUFFER);
    let connection = Arc::new(ClientConnection::new(
        caller,
        subscriber.identity().clone(),
        send_tx,
    ));

    if !state.connections.add(Arc::clone(&connection)) {
        warn!("connection limit reached after upgrade, closing");
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "too many connections".into(),
            })))
            .await;
        let _ = state.gateway.unsubscribe(&subscriber);
        return;
    }

    let connection_start = Instant::now();
    info!(connection = %connection.id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let snapshot_sent = match serde_json::to_string(&snapshot_frame(snapshot)) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    };

    // Cancelled by whichever half finishes first, or by server shutdown.
    let session_token = state.shutdown.token().child_token();

    let outbound_conn = Arc::clone(&connection);
    let outbound_token = session_token.clone();
    let gateway = Arc::clone(&state.gateway);
    let heartbeat_interval = state.config.heartbeat_interval();
    let heartbeat_timeout = state.config.heartbeat_timeout();
    let outbound = tokio::spawn(async move {
        let _guard = outbound_token.clone().drop_guard();
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                () = outbound_token.cancelled() => {
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "closing".into(),
                    }))).await;
                    break;
                }
                update = subscriber.recv() => {
                    let Some(update) = update else { break };
                    let Ok(json) = serde_json::to_string(&update_frame(&update)) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > heartbeat_timeout
                    {
                        warn!("client unresponsive for {heartbeat_timeout:?}, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = gateway.unsubscribe(&subscriber);
    });

    if snapshot_sent {
        loop {
            let msg = tokio::select! {
                () = session_token.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            let Some(Ok(msg)) = msg else { break };

            let text = match msg {
                Message::Text(ref t) => t.to_string(),
                Message::Binary(ref data) => match std::str::from_utf8(data) {
                    Ok(s) => s.to_owned(),
                    Err(_) => {
                        debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!("client sent close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    connection.mark_alive();
                    continue;
                }
            };
            connection.mark_alive();

            let result = handle_message(
                &text,
                &state.gateway,
                &connection.caller,
                &connection.identity,
            )
            .await;
            if !connection.send(result.response_json) {
                info!(method = %result.method, "failed to enqueue response (channel full or closed)");
            }
        }
    }

    session_token.cancel();
    let _ = outbound.await;

    info!(connection = %connection.id, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
    let _ = state.connections.remove(&connection.id);
}
