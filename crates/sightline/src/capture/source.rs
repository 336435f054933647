//! Frame source: camera handle ownership and the capture loop
//!
//! The source owns at most one open camera. Read failures are retried on the
//! same handle; only after `max_consecutive_failures` in a row is the handle
//! released, and the next cycle re-acquires it from the device candidates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::camera::{Camera, CameraOpener, DeviceHints};
use super::encode::encode_frame;
use crate::buffer::FrameBuffer;
use crate::error::CaptureError;
use crate::frame::Frame;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Upper bound for the long side of encoded frames
    pub max_dimension: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Time between capture starts
    pub period: Duration,
    /// Delay before retrying after a failed capture
    pub retry_delay: Duration,
    /// Consecutive read failures before the handle is released
    pub max_consecutive_failures: u32,
    /// Device indices tried in order when acquiring a camera
    pub devices: Vec<u32>,
    /// Best-effort device controls
    pub hints: DeviceHints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_dimension: 640,
            jpeg_quality: 85,
            period: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            max_consecutive_failures: 3,
            devices: vec![0],
            hints: DeviceHints {
                exposure: None,
                gain: Some(100),
                brightness: Some(150),
            },
        }
    }
}

/// Capture statistics (snapshot)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub failures: u64,
    pub acquisitions: u64,
}

/// Lock-free capture counters shared with the stats reporter
#[derive(Debug, Default)]
pub struct CaptureCounters {
    frames_captured: AtomicU64,
    failures: AtomicU64,
    acquisitions: AtomicU64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
        }
    }
}

struct OpenCamera {
    device: u32,
    camera: Box<dyn Camera>,
}

/// Produces encoded frames from a camera.
pub struct FrameSource {
    opener: Box<dyn CameraOpener>,
    camera: Option<OpenCamera>,
    config: CaptureConfig,
    consecutive_failures: u32,
    counters: Arc<CaptureCounters>,
}

impl FrameSource {
    pub fn new(opener: Box<dyn CameraOpener>, config: CaptureConfig) -> Self {
        Self {
            opener,
            camera: None,
            config,
            consecutive_failures: 0,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Shared counters, readable while the source runs on its own thread
    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    /// Device index of the open camera, if any
    pub fn open_device(&self) -> Option<u32> {
        self.camera.as_ref().map(|c| c.device)
    }

    /// Capture and encode one frame, acquiring the camera if needed.
    pub fn capture_next(&mut self) -> Result<Frame, CaptureError> {
        if self.camera.is_none() {
            self.acquire()?;
        }
        let Some(open) = self.camera.as_mut() else {
            return Err(CaptureError::Unavailable {
                tried: self.config.devices.clone(),
            });
        };

        let image = match open.camera.read() {
            Ok(image) => image,
            Err(e) => {
                self.record_read_failure();
                return Err(e);
            }
        };
        self.consecutive_failures = 0;

        let frame = encode_frame(&image, self.config.max_dimension, self.config.jpeg_quality)?;
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    fn acquire(&mut self) -> Result<(), CaptureError> {
        for &device in &self.config.devices {
            match self.opener.open(device, &self.config.hints) {
                Ok(camera) => {
                    self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                    self.camera = Some(OpenCamera { device, camera });
                    return Ok(());
                }
                Err(e) => debug!(device, error = %e, "Camera candidate unavailable"),
            }
        }
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        Err(CaptureError::Unavailable {
            tried: self.config.devices.clone(),
        })
    }

    fn record_read_failure(&mut self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            warn!(
                failures = self.consecutive_failures,
                "Repeated camera read failures, releasing handle"
            );
            self.release();
        }
    }

    /// Drop the camera handle, if open
    pub fn release(&mut self) {
        if let Some(open) = self.camera.take() {
            debug!(device = open.device, "Releasing camera");
        }
        self.consecutive_failures = 0;
    }

    /// Run the capture loop on a dedicated OS thread.
    ///
    /// Must be called from inside a tokio runtime; the thread uses the
    /// runtime's timer so cancellation interrupts its sleeps.
    pub fn spawn(self, buffer: Arc<FrameBuffer>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let runtime = Handle::current();
        std::thread::Builder::new()
            .name("camera-capture".into())
            .spawn(move || self.run(buffer, cancel, runtime))
            .context("Failed to spawn camera capture thread")
    }

    fn run(mut self, buffer: Arc<FrameBuffer>, cancel: CancellationToken, runtime: Handle) {
        info!(
            "Capture loop started: every {:?}, max {}px, quality {}",
            self.config.period, self.config.max_dimension, self.config.jpeg_quality
        );

        while !cancel.is_cancelled() {
            let started = Instant::now();
            let delay = match self.capture_next() {
                Ok(frame) => {
                    debug!(
                        size_kb = frame.size_kb(),
                        width = frame.width,
                        height = frame.height,
                        "Frame captured"
                    );
                    buffer.publish(frame);
                    self.config.period.saturating_sub(started.elapsed())
                }
                Err(e) => {
                    warn!(error = %e, "Capture failed, retrying in {:?}", self.config.retry_delay);
                    self.config.retry_delay
                }
            };

            let cancelled = runtime.block_on(async {
                tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                }
            });
            if cancelled {
                break;
            }
        }

        self.release();
        info!("Capture loop stopped");
    }
}
