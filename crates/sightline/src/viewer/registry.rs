//! Connected viewer sessions
//!
//! The registry maps a [`ViewerId`] to the sink that delivers text messages to
//! that viewer. Broadcasting serializes the envelope once and pushes the same
//! `Arc<str>` to every sink. A sink that refuses a message is removed on the
//! spot; the remaining viewers still receive it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::protocol::Envelope;

/// Unique identifier for a viewer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Outbound half of a viewer connection.
///
/// `push` must not block; a viewer that cannot accept a message right now is
/// treated as gone.
pub trait ViewerSink: Send + Sync {
    fn push(&self, text: Arc<str>) -> Result<(), SinkError>;
}

/// Sink backed by a bounded mpsc channel drained by the connection task.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    /// Create a sink and the receiver its connection task reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ViewerSink for ChannelSink {
    fn push(&self, text: Arc<str>) -> Result<(), SinkError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

struct ViewerSession {
    sink: Arc<dyn ViewerSink>,
    connected_at: Instant,
}

/// Registry statistics (snapshot)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Currently connected viewers
    pub viewers: usize,
    /// Viewers ever registered
    pub registered: u64,
    /// Viewers removed because their sink failed
    pub dropped: u64,
    /// Individual messages accepted by sinks
    pub delivered: u64,
}

/// Tracks connected viewers and fans messages out to them.
pub struct ViewerRegistry {
    sessions: RwLock<HashMap<ViewerId, ViewerSession>>,
    next_id: AtomicU64,
    registered: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            registered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Register a sink and return its new id
    pub async fn add(&self, sink: Arc<dyn ViewerSink>) -> ViewerId {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().await.insert(
            id,
            ViewerSession {
                sink,
                connected_at: Instant::now(),
            },
        );
        self.registered.fetch_add(1, Ordering::Relaxed);
        debug!(viewer = %id, "Viewer registered");
        id
    }

    /// Remove a viewer. Unknown ids are ignored.
    pub async fn remove(&self, id: ViewerId) {
        if let Some(session) = self.sessions.write().await.remove(&id) {
            debug!(
                viewer = %id,
                connected_secs = session.connected_at.elapsed().as_secs(),
                "Viewer removed"
            );
        }
    }

    /// Push an envelope to every viewer.
    ///
    /// Returns the number of viewers that accepted it. Viewers whose sink
    /// fails are removed before this returns.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let text: Arc<str> = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "Failed to serialize envelope");
                return 0;
            }
        };

        let mut failed = Vec::new();
        let mut delivered = 0;
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                match session.sink.push(Arc::clone(&text)) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(viewer = %id, error = %e, "Viewer sink failed");
                        failed.push(*id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &failed {
                if sessions.remove(id).is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of connected viewers
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, id: ViewerId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            viewers: self.len().await,
            registered: self.registered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
