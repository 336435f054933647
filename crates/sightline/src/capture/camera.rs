//! Camera devices
//!
//! Provides a camera backed by an `ffmpeg` child streaming a V4L2 device,
//! and a synthetic test pattern for development without hardware.
//!
//! Both are blocking and meant to be driven from the dedicated capture thread.
//! The ffmpeg camera keeps one child process per open handle; a background
//! reader thread splits its MJPEG output into images.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tracing::{debug, info, warn};

use crate::error::CaptureError;

/// Best-effort device controls applied when a camera is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceHints {
    /// Manual exposure value (device units); `None` leaves auto exposure on
    pub exposure: Option<i32>,
    pub gain: Option<i32>,
    pub brightness: Option<i32>,
}

impl DeviceHints {
    /// Render as a `v4l2-ctl --set-ctrl` argument, or `None` if nothing is set
    fn v4l2_controls(&self) -> Option<String> {
        let mut controls = Vec::new();
        if let Some(exposure) = self.exposure {
            // 1 = manual mode on UVC devices
            controls.push("auto_exposure=1".to_string());
            controls.push(format!("exposure_time_absolute={}", exposure));
        }
        if let Some(gain) = self.gain {
            controls.push(format!("gain={}", gain));
        }
        if let Some(brightness) = self.brightness {
            controls.push(format!("brightness={}", brightness));
        }
        if controls.is_empty() {
            None
        } else {
            Some(controls.join(","))
        }
    }
}

/// An open camera handle. Dropping it releases the device.
pub trait Camera: Send {
    /// Read one image. Blocks until the device delivers or fails.
    fn read(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Acquires camera handles by device index.
pub trait CameraOpener: Send {
    fn open(&mut self, device: u32, hints: &DeviceHints) -> Result<Box<dyn Camera>, CaptureError>;
}

// ========== ffmpeg / V4L2 ==========

/// Opens `/dev/video<N>` and streams MJPEG frames out of a long-running `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    /// ffmpeg executable
    pub ffmpeg: String,
    /// v4l2-ctl executable used for device hints
    pub v4l2_ctl: String,
    /// Directory holding the video device nodes
    pub device_dir: PathBuf,
    /// Longest wait for a frame before a read counts as failed
    pub read_timeout: Duration,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            v4l2_ctl: "v4l2-ctl".to_string(),
            device_dir: PathBuf::from("/dev"),
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl FfmpegOpener {
    fn apply_hints(&self, path: &Path, hints: &DeviceHints) {
        let Some(controls) = hints.v4l2_controls() else {
            return;
        };
        let result = Command::new(&self.v4l2_ctl)
            .arg("-d")
            .arg(path)
            .arg(format!("--set-ctrl={}", controls))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!(device = %path.display(), %controls, "Applied device hints"),
            Ok(status) => debug!(device = %path.display(), %controls, %status, "Device rejected hints"),
            Err(e) => debug!(device = %path.display(), error = %e, "v4l2-ctl unavailable, hints skipped"),
        }
    }
}

impl CameraOpener for FfmpegOpener {
    fn open(&mut self, device: u32, hints: &DeviceHints) -> Result<Box<dyn Camera>, CaptureError> {
        let path = self.device_dir.join(format!("video{}", device));
        if !path.exists() {
            return Err(CaptureError::Open {
                device,
                reason: format!("{} does not exist", path.display()),
            });
        }
        self.apply_hints(&path, hints);

        let mut child = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-f", "v4l2", "-i"])
            .arg(&path)
            .args(["-f", "image2pipe", "-vcodec", "mjpeg", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Open {
                device,
                reason: format!("failed to spawn {}: {}", self.ffmpeg, e),
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Open {
                device,
                reason: "ffmpeg stdout not captured".into(),
            });
        };

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name(format!("camera-reader-{}", device))
            .spawn(move || read_mjpeg_stream(stdout, tx));
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Io(e));
        }

        info!(device = %path.display(), pid = child.id(), "Camera opened");
        Ok(Box::new(FfmpegCamera {
            path,
            child,
            frames: rx,
            read_timeout: self.read_timeout,
        }))
    }
}

/// Upper bound on buffered stream bytes without a complete image
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Split a concatenated MJPEG stream into JPEG images and send each one.
///
/// Returns when the stream ends, fails, or the receiver is gone.
fn read_mjpeg_stream<R: Read>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut pending: Vec<u8> = Vec::with_capacity(256 * 1024);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Camera stream read error");
                return;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(jpeg) = next_jpeg(&mut pending) {
            if tx.send(jpeg).is_err() {
                return;
            }
        }
        if pending.len() > MAX_PENDING_BYTES {
            warn!(bytes = pending.len(), "No JPEG boundary in camera stream, discarding");
            pending.clear();
        }
    }
}

/// Remove and return the first complete JPEG (SOI..EOI) in `pending`.
/// Bytes before the first SOI marker are discarded.
fn next_jpeg(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = find_marker(pending, 0, 0xd8) else {
        // Keep a trailing 0xff, it may start the next SOI
        let keep = usize::from(pending.last() == Some(&0xff));
        pending.drain(..pending.len() - keep);
        return None;
    };
    let end = find_marker(pending, start + 2, 0xd9)?;
    let jpeg = pending[start..end + 2].to_vec();
    pending.drain(..end + 2);
    Some(jpeg)
}

fn find_marker(data: &[u8], from: usize, marker: u8) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xff && w[1] == marker)
        .map(|i| i + from)
}

/// Handle to a V4L2 device streamed through one ffmpeg child.
///
/// Dropping it kills the child, which releases the device.
pub struct FfmpegCamera {
    path: PathBuf,
    child: Child,
    frames: mpsc::Receiver<Vec<u8>>,
    read_timeout: Duration,
}

impl Camera for FfmpegCamera {
    fn read(&mut self) -> Result<DynamicImage, CaptureError> {
        let started = Instant::now();
        let mut jpeg = match self.frames.recv_timeout(self.read_timeout) {
            Ok(jpeg) => jpeg,
            Err(RecvTimeoutError::Timeout) => {
                return Err(CaptureError::Read(format!(
                    "no frame from {} within {:?}",
                    self.path.display(),
                    self.read_timeout
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = match self.child.try_wait() {
                    Ok(Some(status)) => status.to_string(),
                    _ => "stream closed".to_string(),
                };
                return Err(CaptureError::Read(format!("ffmpeg stopped: {}", status)));
            }
        };
        // Only the newest queued frame matters
        while let Ok(newer) = self.frames.try_recv() {
            jpeg = newer;
        }

        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .map_err(|e| CaptureError::Read(format!("undecodable camera image: {}", e)))?;
        debug!(
            device = %self.path.display(),
            width = image.width(),
            height = image.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Camera read"
        );
        Ok(image)
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        info!(device = %self.path.display(), "Camera released");
    }
}

// ========== Test pattern ==========

/// Opens synthetic cameras that render a moving gradient.
#[derive(Debug, Clone)]
pub struct TestPatternOpener {
    pub width: u32,
    pub height: u32,
}

impl Default for TestPatternOpener {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl CameraOpener for TestPatternOpener {
    fn open(&mut self, device: u32, _hints: &DeviceHints) -> Result<Box<dyn Camera>, CaptureError> {
        info!(
            device,
            "Test pattern camera opened: {}x{}", self.width, self.height
        );
        Ok(Box::new(TestPatternCamera {
            width: self.width,
            height: self.height,
            frame_num: 0,
        }))
    }
}

/// Synthetic camera; every read shifts the pattern so frames differ.
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    frame_num: u32,
}

impl Camera for TestPatternCamera {
    fn read(&mut self) -> Result<DynamicImage, CaptureError> {
        let shift = self.frame_num.wrapping_mul(8);
        let bar = (self.frame_num.wrapping_mul(16)) % self.width.max(1);
        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            if x.abs_diff(bar) < 8 {
                return Rgb([255, 255, 255]);
            }
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                (((x + y) / 2) % 256) as u8,
            ])
        });
        self.frame_num = self.frame_num.wrapping_add(1);
        Ok(DynamicImage::ImageRgb8(image))
    }
}
