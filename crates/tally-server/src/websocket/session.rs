//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tally_core::OutboundMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL,
    HEARTBEAT_TIMEOUTS_TOTAL,
};

/// How long the writer gets to flush and send its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection, which queues `connection_established`
/// 2. Forwards queued outbound messages and periodic Ping frames
/// 3. Routes every text frame (or UTF-8 binary frame) through the broker
/// 4. Ends on client close, read error, heartbeat timeout or `shutdown`
/// 5. Releases every subscription the connection held
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    broker: Arc<Broker>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (id, mut send_rx) = broker.accept();
    let _ = tracing::Span::current().record("conn_id", tracing::field::display(&id));
    let Some(connection) = broker.registry().get(&id) else {
        return;
    };

    info!("client connected");
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);

    let session = shutdown.child_token();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let writer_cancel = session.clone();
    let ping_every = config.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                queued = send_rx.recv() => {
                    let Some(text) = queued else { break };
                    if ws_tx.send(Message::Text((&*text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let heartbeat = tokio::spawn({
        let connection = Arc::clone(&connection);
        let session = session.clone();
        let (interval, timeout) = (config.heartbeat_interval, config.heartbeat_timeout);
        async move {
            if run_heartbeat(connection, interval, timeout, session.clone()).await
                == HeartbeatResult::TimedOut
            {
                warn!(?timeout, "client unresponsive, disconnecting");
                counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                session.cancel();
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = session.cancelled() => break,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        match msg {
            Message::Text(text) => broker.route(&id, text.as_str()).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => broker.route(&id, text).await,
                Err(_) => {
                    debug!(len = data.len(), "received non-UTF-8 binary frame");
                    let _ = broker.registry().send_message(
                        &id,
                        &OutboundMessage::error("invalid message format: binary frame is not UTF-8"),
                    );
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.cancel();
    let dropped = connection.drop_count();
    let lifetime = connection.age();
    drop(connection);
    let closed_watches = broker.disconnect(&id).await;

    let _ = heartbeat.await;
    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        writer_abort.abort();
    }

    counter!(DISCONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(lifetime.as_secs_f64());
    info!(
        closed_watches,
        dropped,
        lifetime_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX),
        "client disconnected"
    );
}
