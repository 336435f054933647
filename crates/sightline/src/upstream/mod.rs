//! Resilient link to the remote inference service
//!
//! The link is a four-state machine driven by a single task:
//!
//! ```text
//! Disconnected ─start─▶ Connecting ─ok─▶ Connected
//!                           ▲   │fail        │ send/recv failure, close, timeout
//!                           │   ▼            ▼
//!                           └─ Backoff ◀─────┘
//! ```
//!
//! While connected, each frame newer than the last one sent is peeked from the
//! [`FrameBuffer`], marked as sent, shipped as raw binary JPEG, and exactly one
//! response is awaited before the next send. The marker is advanced before
//! sending, so a frame whose exchange failed is never replayed after a
//! reconnect.

pub mod ws;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::FrameBuffer;
use crate::error::{LinkError, MalformedMessage};
use crate::protocol::DescriptionResult;
use crate::router::ResultRouter;

pub use ws::WsConnector;

/// Connection state of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Upstream link configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL of the inference service
    pub url: String,
    /// Fixed delay spent in Backoff before reconnecting
    pub reconnect_delay: Duration,
    /// Bound on connection establishment
    pub handshake_timeout: Duration,
    /// Bound on each send and on the response that follows it
    pub response_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws".to_string(),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// A message received from the inference service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

/// Establishes upstream sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamSession>, LinkError>;
}

/// An established upstream connection.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Send one encoded frame as a binary message
    async fn send_frame(&mut self, jpeg: Bytes) -> Result<(), LinkError>;

    /// Wait for the next data message. Control frames are handled internally;
    /// a remote close yields [`LinkError::Closed`].
    async fn recv(&mut self) -> Result<Inbound, LinkError>;

    /// Close the connection, best-effort
    async fn close(&mut self);
}

/// Upstream statistics (snapshot)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Successful handshakes
    pub connects: u64,
    /// Entries into Backoff
    pub failures: u64,
    pub frames_sent: u64,
    pub descriptions: u64,
    pub malformed: u64,
}

/// Lock-free counters shared with status reporting
#[derive(Debug, Default)]
pub struct LinkCounters {
    connects: AtomicU64,
    failures: AtomicU64,
    frames_sent: AtomicU64,
    descriptions: AtomicU64,
    malformed: AtomicU64,
}

impl LinkCounters {
    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            connects: self.connects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            descriptions: self.descriptions.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// The single upstream link of the process.
pub struct UpstreamLink {
    config: UpstreamConfig,
    connector: Arc<dyn Connector>,
    buffer: Arc<FrameBuffer>,
    router: ResultRouter,
    state_tx: watch::Sender<LinkState>,
    /// Sequence number of the last frame handed to the remote
    last_sent: u64,
    counters: Arc<LinkCounters>,
}

impl UpstreamLink {
    pub fn new(
        config: UpstreamConfig,
        connector: Arc<dyn Connector>,
        buffer: Arc<FrameBuffer>,
        router: ResultRouter,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            connector,
            buffer,
            router,
            state_tx,
            last_sent: 0,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// Observe state changes. Only the link task writes.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        Arc::clone(&self.counters)
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Upstream link state");
        }
    }

    /// Drive the state machine until cancelled. Retries forever.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(url = %self.config.url, "Upstream link started");

        loop {
            self.set_state(LinkState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(mut session) => {
                    self.set_state(LinkState::Connected);
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    info!(url = %self.config.url, "Upstream connected");

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => None,
                        e = self.exchange(session.as_mut()) => Some(e),
                    };
                    session.close().await;

                    match outcome {
                        None => break,
                        Some(e) => warn!(
                            error = %e,
                            "Upstream link lost, reconnecting in {:?}",
                            self.config.reconnect_delay
                        ),
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    "Upstream connect failed, retrying in {:?}",
                    self.config.reconnect_delay
                ),
            }

            self.set_state(LinkState::Backoff);
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(LinkState::Disconnected);
        info!("Upstream link stopped");
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, LinkError> {
        match timeout(self.config.handshake_timeout, self.connector.connect(&self.config.url)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::HandshakeTimeout(self.config.handshake_timeout)),
        }
    }

    /// Send/receive loop for one session. Only returns on failure.
    async fn exchange(&mut self, session: &mut dyn UpstreamSession) -> LinkError {
        let limit = self.config.response_timeout;
        loop {
            let (seq, frame) = self.buffer.wait_newer(self.last_sent).await;
            self.last_sent = seq;

            match timeout(limit, session.send_frame(frame.payload.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return e,
                Err(_) => return LinkError::Send(format!("timed out after {:?}", limit)),
            }
            self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            debug!(
                seq,
                captured_ms = frame.timestamp_ms(),
                size_kb = frame.size_kb(),
                "Frame sent upstream"
            );

            let inbound = match timeout(limit, session.recv()).await {
                Ok(Ok(inbound)) => inbound,
                Ok(Err(e)) => return e,
                Err(_) => return LinkError::ResponseTimeout(limit),
            };
            self.handle_response(inbound).await;
        }
    }

    async fn handle_response(&self, inbound: Inbound) {
        let parsed = match inbound {
            Inbound::Text(text) => DescriptionResult::parse(&text),
            Inbound::Binary(data) => Err(MalformedMessage::Binary(data.len())),
        };
        match parsed {
            Ok(result) => {
                self.counters.descriptions.fetch_add(1, Ordering::Relaxed);
                self.router.route(result).await;
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping malformed upstream message");
            }
        }
    }
}
