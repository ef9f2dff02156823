//! WebSocket connection loop.
//!
//! Bridges one axum socket to the [`GatewayWsManager`]: client frames are
//! handed to [`GatewayWsManager::handle_message`], and everything the
//! manager queues for this session is written back to the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::manager::{GatewayWsManager, OUTBOUND_BUFFER};
use crate::domain::TelescopeId;

/// Runs the read/write loop for a single WebSocket connection.
///
/// The loop ends when the client closes, the socket errors, or the manager
/// drops the session (reaped or disconnected).
pub async fn run_connection(
    socket: WebSocket,
    manager: Arc<GatewayWsManager>,
    default_telescope: Option<TelescopeId>,
) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    manager.connect(connection_id, out_tx, default_telescope).await;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        manager.handle_message(connection_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(%connection_id, error = %err, "ws receive failed");
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = out_rx.recv() => {
                let Some(frame) = outgoing else {
                    break;
                };
                if ws_tx.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    manager.disconnect(connection_id).await;
    let _ = ws_tx.close().await;
}
