//! Raster backend: decode, transform, encode.
//!
//! Runs synchronously on a worker thread owned by the queue; nothing here
//! may be called from the async runtime. The backend sits behind a trait so
//! tests can substitute deterministic stand-ins for real pixel work.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

use super::{OutputFormat, RenditionTask};

/// JPEG quality for encoded renditions.
const JPEG_QUALITY: u8 = 75;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
}

/// Synchronous pixel pipeline. Implementations keep whatever thread-local
/// state they need; the queue guarantees calls for one worker always happen
/// on the same OS thread.
pub trait RasterBackend: Send + Sync + 'static {
    fn render(&self, source: &[u8], task: &RenditionTask) -> Result<Vec<u8>, BackendError>;
}

/// Backend built on the `image` crate.
///
/// Resizes by cover-and-crop so the output always has the exact requested
/// dimensions, then applies the optional transforms in a fixed order (blur,
/// then grayscale) so identical tasks produce identical bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageBackend;

impl ImageBackend {
    pub fn new() -> Self {
        Self
    }
}

impl RasterBackend for ImageBackend {
    fn render(&self, source: &[u8], task: &RenditionTask) -> Result<Vec<u8>, BackendError> {
        let decoded = image::load_from_memory(source)
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let mut rendered = decoded.resize_to_fill(task.width, task.height, FilterType::Lanczos3);

        if let Some(amount) = task.blur {
            rendered = rendered.blur(f32::from(amount));
        }

        if task.grayscale {
            rendered = rendered.grayscale();
        }

        let mut encoded = Vec::new();
        match task.format {
            OutputFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
                rendered
                    .write_with_encoder(encoder)
                    .map_err(|e| BackendError::Encode(e.to_string()))?;
            }
            OutputFormat::WebP => {
                // The webp encoder only takes RGB8/RGBA8 input.
                let rendered = DynamicImage::ImageRgb8(rendered.to_rgb8());
                let encoder = WebPEncoder::new_lossless(&mut encoded);
                rendered
                    .write_with_encoder(encoder)
                    .map_err(|e| BackendError::Encode(e.to_string()))?;
            }
        }
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// A 64x48 JPEG with a simple gradient, enough structure for resize and
    /// blur to produce distinct outputs.
    fn fixture_jpeg() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(encoder)
            .unwrap();
        buffer
    }

    fn task(width: u32, height: u32, format: OutputFormat) -> RenditionTask {
        RenditionTask {
            id: "fixture".to_string(),
            width,
            height,
            blur: None,
            grayscale: false,
            format,
        }
    }

    #[test]
    fn test_render_jpeg_has_requested_dimensions() {
        let backend = ImageBackend::new();
        let output = backend.render(&fixture_jpeg(), &task(32, 32, OutputFormat::Jpeg)).unwrap();

        let decoded = image::load_from_memory(&output).unwrap();
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 32);
    }

    #[test]
    fn test_render_webp_decodes_as_webp() {
        let backend = ImageBackend::new();
        let output = backend
            .render(&fixture_jpeg(), &task(20, 30, OutputFormat::WebP))
            .unwrap();

        let format = image::guess_format(&output).unwrap();
        assert_eq!(format, image::ImageFormat::WebP);
        let decoded = image::load_from_memory(&output).unwrap();
        assert_eq!(decoded.width(), 20);
        assert_eq!(decoded.height(), 30);
    }

    #[test]
    fn test_render_is_deterministic() {
        let backend = ImageBackend::new();
        let source = fixture_jpeg();
        let task = task(32, 24, OutputFormat::Jpeg);

        let first = backend.render(&source, &task).unwrap();
        let second = backend.render(&source, &task).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_blur_changes_output() {
        let backend = ImageBackend::new();
        let source = fixture_jpeg();

        let plain = backend.render(&source, &task(32, 24, OutputFormat::Jpeg)).unwrap();
        let mut blur_task = task(32, 24, OutputFormat::Jpeg);
        blur_task.blur = Some(5);
        let blurred = backend.render(&source, &blur_task).unwrap();

        assert_ne!(plain, blurred);
    }

    #[test]
    fn test_grayscale_output_is_gray() {
        let backend = ImageBackend::new();
        let mut gray_task = task(16, 16, OutputFormat::WebP);
        gray_task.grayscale = true;

        let output = backend.render(&fixture_jpeg(), &gray_task).unwrap();
        let decoded = image::load_from_memory(&output).unwrap().to_rgb8();
        for pixel in decoded.pixels() {
            assert_eq!(pixel[0], pixel[1]);
            assert_eq!(pixel[1], pixel[2]);
        }
    }

    #[test]
    fn test_garbage_input_is_decode_error() {
        let backend = ImageBackend::new();
        let result = backend.render(b"not an image", &task(10, 10, OutputFormat::Jpeg));
        assert!(matches!(result, Err(BackendError::Decode(_))));
    }
}
