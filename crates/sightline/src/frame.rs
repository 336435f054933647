//! Frame types for captured camera images

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Encoding of a frame payload.
///
/// Only JPEG is produced today; the enum keeps the wire metadata explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    /// Baseline JPEG
    Jpeg,
}

/// A single encoded camera frame.
///
/// Immutable once produced. After publication it is shared as `Arc<Frame>`
/// between the local broadcaster and the upstream link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Encoded image bytes
    pub payload: Bytes,
    /// Wall-clock capture time
    pub captured_at: SystemTime,
    /// Payload encoding
    pub encoding: FrameEncoding,
    /// Encoded width in pixels
    pub width: u32,
    /// Encoded height in pixels
    pub height: u32,
}

impl Frame {
    /// Create a JPEG frame stamped with the current time
    pub fn jpeg(payload: Bytes, width: u32, height: u32) -> Self {
        Self {
            payload,
            captured_at: SystemTime::now(),
            encoding: FrameEncoding::Jpeg,
            width,
            height,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_captured_at(mut self, captured_at: SystemTime) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Capture time in milliseconds since the Unix epoch
    pub fn timestamp_ms(&self) -> u64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    /// Payload size in kilobytes
    pub fn size_kb(&self) -> f64 {
        self.payload.len() as f64 / 1024.0
    }
}
