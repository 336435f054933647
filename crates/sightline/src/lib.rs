//! Sightline - live camera relay with a remote inference bridge
//!
//! Frames flow from a camera through a single-slot buffer to two consumers:
//!
//! - **Local viewers**: the [`LocalBroadcaster`] drains the buffer and fans
//!   each frame out to every connected WebSocket viewer.
//! - **Upstream**: the [`UpstreamLink`] ships frames to an inference service
//!   and routes the descriptions it returns back to the same viewers.
//!
//! Feature flags:
//!
//! - **`web`** (default): axum viewer server (`/ws`, `/api/status`, `/health`)

// Core modules
mod buffer;
mod error;
mod frame;
mod protocol;

pub use buffer::{BufferStats, FrameBuffer};
pub use error::{CaptureError, ConfigError, LinkError, MalformedMessage, SinkError};
pub use frame::{Frame, FrameEncoding};
pub use protocol::{DescriptionResult, Envelope};

// Camera devices, encoding and the capture thread
pub mod capture;

// Edge daemon configuration
pub mod config;

// Description routing
pub mod router;

// Upstream inference link
pub mod upstream;

// Viewer registry and broadcaster
pub mod viewer;

// Web: axum HTTP server and viewer WebSocket
#[cfg(feature = "web")]
pub mod web;

pub use capture::{CaptureConfig, FrameSource};
pub use config::EdgeConfig;
pub use router::ResultRouter;
pub use upstream::{LinkState, UpstreamConfig, UpstreamLink, WsConnector};
pub use viewer::{LocalBroadcaster, ViewerId, ViewerRegistry};
