//! Viewer WebSocket session.
//!
//! Text protocol (viewer ← server), one JSON envelope per message:
//!   {"type":"frame","data":"<base64 JPEG>"}
//!   {"type":"description","content":"<text>"}
//!
//! Viewer → server traffic is liveness only: pings are answered, text and
//! binary are ignored, close or error ends the session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::viewer::{ChannelSink, ViewerRegistry};

/// Handle a single viewer connection.
pub async fn handle_viewer(
    socket: WebSocket,
    registry: Arc<ViewerRegistry>,
    queue: usize,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut rx) = ChannelSink::new(queue);
    let id = registry.add(Arc::new(sink)).await;
    info!(viewer = %id, "Viewer connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            // None means the registry dropped our sink
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    debug!(viewer = %id, "Viewer sink removed by registry");
                    break;
                };
                if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        debug!(viewer = %id, error = %e, "Viewer socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    registry.remove(id).await;
    info!(viewer = %id, "Viewer disconnected");
}
