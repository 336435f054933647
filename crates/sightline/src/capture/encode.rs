//! JPEG encoding with a bounded long dimension

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::CaptureError;
use crate::frame::Frame;

/// Compute output dimensions so the long side is at most `max_dimension`.
///
/// Aspect ratio is preserved and images are never upscaled. A zero limit
/// disables scaling.
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let long = width.max(height);
    if max_dimension == 0 || long <= max_dimension {
        return (width, height);
    }
    let scale = max_dimension as f64 / long as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Scale and JPEG-encode a captured image into a [`Frame`].
pub fn encode_frame(
    image: &DynamicImage,
    max_dimension: u32,
    quality: u8,
) -> Result<Frame, CaptureError> {
    let (width, height) = scaled_dimensions(image.width(), image.height(), max_dimension);
    let rgb = if (width, height) == (image.width(), image.height()) {
        image.to_rgb8()
    } else {
        // Triangle is the closest match to area averaging for downscales.
        image.resize_exact(width, height, FilterType::Triangle).to_rgb8()
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(&rgb)?;

    Ok(Frame::jpeg(Bytes::from(buffer), width, height))
}
