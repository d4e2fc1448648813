//! WebSocket session lifecycle — one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{ContextSlot, Dispatcher, RelayError};
use relay_wire::ResponseEnvelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::handler::{cleanup_connection, process_frame};
use crate::registry::ConnectionRegistry;

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection with the registry
/// 2. Forwards outbound envelopes and sends periodic Ping frames,
///    disconnecting unresponsive clients
/// 3. Dispatches incoming frames through the subscription multiplexer
/// 4. On context-resolution failure, sends one best-effort null-id error and
///    closes after a grace delay
/// 5. Cleans up on disconnect: every subscription is cancelled, nothing is
///    sent
///
/// Unit coverage lives in `handler` and `connection`; the socket plumbing
/// here is exercised by `tests/ws.rs` against a real client.
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session<Ctx: Send + Sync + 'static>(
    ws: WebSocket,
    conn_id: String,
    ctx: ContextSlot<Ctx>,
    dispatcher: Arc<dyn Dispatcher<Ctx>>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<String>(config.max_send_queue);
    let connection = Arc::new(ClientConnection::new(conn_id.clone(), send_tx));

    let connection_start = std::time::Instant::now();
    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    registry.add(connection.clone()).await;

    // Fires when the session must end for any local reason: heartbeat
    // timeout, write failure, or context-resolution failure.
    let closing = CancellationToken::new();

    // Watch context resolution. On failure the connection receives one
    // best-effort connection-scoped error, then closes after a grace delay
    // long enough for the message to reach the peer.
    let watcher = {
        let ctx = ctx.clone();
        let conn = connection.clone();
        let closing = closing.clone();
        let grace = Duration::from_millis(config.close_grace_ms);
        tokio::spawn(async move {
            if let Err(err) = ctx.get().await {
                warn!(code = err.code(), "context resolution failed, closing");
                let _ = conn.send_envelope(&ResponseEnvelope::error(None, &err));
                tokio::time::sleep(grace).await;
                closing.cancel();
            }
        })
    };

    // Outbound forwarder with heartbeat pings.
    let outbound = {
        let conn = connection.clone();
        let closing = closing.clone();
        let ping_every = Duration::from_secs(config.heartbeat_interval_secs);
        let pong_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(ping_every);
            // Skip the immediate first tick
            let _ = ping_interval.tick().await;

            loop {
                tokio::select! {
                    () = closing.cancelled() => break,
                    msg = send_rx.recv() => {
                        match msg {
                            Some(text) => {
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping_interval.tick() => {
                        if !conn.check_alive() && conn.last_pong_elapsed() > pong_timeout {
                            warn!("client unresponsive for {pong_timeout:?}, disconnecting");
                            break;
                        }
                        if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Whatever ended the writer ends the session.
            closing.cancel();
        })
    };

    // Inbound loop.
    loop {
        let incoming = tokio::select! {
            biased;
            () = closing.cancelled() => break,
            incoming = ws_rx.next() => incoming,
        };
        let Some(Ok(msg)) = incoming else { break };
        match msg {
            Message::Text(text) => {
                process_frame(text.as_str(), &connection, &ctx, &dispatcher);
            }
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => process_frame(text, &connection, &ctx, &dispatcher),
                Err(e) => {
                    // Not a silent drop: undecodable bytes are a protocol error.
                    let err = RelayError::parse(format!("frame is not UTF-8: {e}"));
                    let _ = connection.send_envelope(&ResponseEnvelope::error(None, &err));
                }
            },
            Message::Ping(_) | Message::Pong(_) => connection.mark_alive(),
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        }
    }

    info!(dropped = connection.drop_count(), "client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());

    outbound.abort();
    watcher.abort();
    cleanup_connection(&connection);
    registry.remove(&conn_id).await;
}
