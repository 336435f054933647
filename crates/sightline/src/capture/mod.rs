//! Camera capture
//!
//! - [`camera`]: device handles (ffmpeg/V4L2 and a synthetic test pattern)
//! - [`encode`]: scaling and JPEG encoding
//! - [`source`]: handle ownership, failure escalation and the capture thread

pub mod camera;
pub mod encode;
pub mod source;

pub use camera::{Camera, CameraOpener, DeviceHints, FfmpegOpener, TestPatternOpener};
pub use encode::{encode_frame, scaled_dimensions};
pub use source::{CaptureConfig, CaptureCounters, CaptureStats, FrameSource};
