//! Periodic push of the latest frame to local viewers

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::ViewerRegistry;
use crate::buffer::FrameBuffer;
use crate::protocol::Envelope;

/// Drains the frame buffer on a fixed period and broadcasts what it finds.
pub struct LocalBroadcaster {
    buffer: Arc<FrameBuffer>,
    registry: Arc<ViewerRegistry>,
    period: Duration,
}

impl LocalBroadcaster {
    pub fn new(buffer: Arc<FrameBuffer>, registry: Arc<ViewerRegistry>, period: Duration) -> Self {
        Self {
            buffer,
            registry,
            period,
        }
    }

    /// One cycle: broadcast the unread frame, if any.
    ///
    /// Returns `true` if a frame was taken from the buffer.
    pub async fn tick(&self) -> bool {
        let Some(frame) = self.buffer.take_if_present() else {
            return false;
        };
        let delivered = self.registry.broadcast(&Envelope::frame(&frame)).await;
        debug!(
            delivered,
            size_kb = frame.size_kb(),
            "Frame broadcast"
        );
        true
    }

    /// Tick until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Local broadcaster started: every {:?}", self.period);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Local broadcaster stopped");
    }
}
