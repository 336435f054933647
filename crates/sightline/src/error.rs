//! Error taxonomy for the relay core.
//!
//! Every variant here is recoverable: capture errors skip a cycle, link
//! errors send the upstream link into backoff, malformed messages are logged
//! and dropped, and sink errors remove one viewer. Only configuration errors
//! surface at startup.

use std::time::Duration;

use thiserror::Error;

/// Camera acquisition, read, or encode failure.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no camera could be opened (tried devices {tried:?})")]
    Unavailable { tried: Vec<u32> },

    #[error("camera {device} failed to open: {reason}")]
    Open { device: u32, reason: String },

    #[error("camera read failed: {0}")]
    Read(String),

    #[error("frame encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream connection failure. Always answered with backoff.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("remote closed the connection")]
    Closed,
}

/// An inbound message that is not a recognised envelope.
#[derive(Error, Debug)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected message type {0:?}")]
    UnexpectedType(String),

    #[error("unexpected binary message ({0} bytes)")]
    Binary(usize),
}

/// A viewer sink refused a message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("viewer disconnected")]
    Closed,

    #[error("viewer queue full")]
    Full,
}

/// Invalid configuration value.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
