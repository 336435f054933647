//! WebSocket transport for the upstream link

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Connector, Inbound, UpstreamSession};
use crate::error::LinkError;

/// Connects to the inference service with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamSession>, LinkError> {
        let (stream, response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| LinkError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(url, status = %response.status(), "Upstream handshake complete");
        Ok(Box::new(WsSession { stream }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UpstreamSession for WsSession {
    async fn send_frame(&mut self, jpeg: Bytes) -> Result<(), LinkError> {
        self.stream
            .send(Message::Binary(jpeg))
            .await
            .map_err(|e| LinkError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Inbound, LinkError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text.to_string())),
                Some(Ok(Message::Binary(data))) => return Ok(Inbound::Binary(data)),
                // tungstenite queues the pong itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Upstream sent close");
                    return Err(LinkError::Closed);
                }
                Some(Err(e)) => return Err(LinkError::Receive(e.to_string())),
                None => return Err(LinkError::Closed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Upstream close was not clean");
        }
    }
}
