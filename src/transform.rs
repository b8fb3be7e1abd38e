use crate::resolution::{ResolutionDescriptor, Target};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Formats the pipeline writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    /// JPEG, PNG and WebP sources keep their format; anything else becomes JPEG.
    pub fn for_source(source: image::ImageFormat) -> Self {
        match source {
            image::ImageFormat::Png => OutputFormat::Png,
            image::ImageFormat::WebP => OutputFormat::WebP,
            _ => OutputFormat::Jpeg,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }
}

/// Pipeline output.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub bytes: Bytes,
    pub content_type: String,
    /// False when the input was passed through unmodified.
    pub transformed: bool,
}

/// Sniffs the format from magic bytes, falling back to the declared type.
pub fn detect_format(bytes: &[u8], declared: &str) -> Option<image::ImageFormat> {
    image::guess_format(bytes)
        .ok()
        .or_else(|| image::ImageFormat::from_mime_type(declared.trim()))
}

/// Content type for bytes served as-is: the declared one when it names an
/// image, otherwise whatever sniffing finds.
fn passthrough_content_type(bytes: &[u8], declared: &str) -> String {
    if declared.trim_start().starts_with("image/") {
        return declared.to_string();
    }
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) if !declared.is_empty() => declared.to_string(),
        Err(_) => "application/octet-stream".to_string(),
    }
}

/// Decodes raw image bytes into a [`DynamicImage`].
///
/// The format comes from magic bytes first and the declared content type
/// second, so origins that label everything `application/octet-stream` still
/// decode.
///
/// # Parameters
/// * `bytes` - Raw encoded image data
/// * `declared` - Content type reported by the origin
///
/// # Returns
/// The decoded image and the source format it was read as.
///
/// # Errors
/// - `TransformError::UnknownFormat` when neither sniffing nor the declared
///   type names a supported format
/// - `TransformError::Decode` when the data is truncated or malformed
pub fn decode_image(bytes: &[u8], declared: &str) -> Result<(DynamicImage, image::ImageFormat), TransformError> {
    let format = detect_format(bytes, declared).ok_or(TransformError::UnknownFormat)?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    Ok((img, format))
}

/// Scales `img` down to fit within the given bounds, preserving aspect ratio.
///
/// Uses Lanczos3 resampling.
///
/// # Parameters
/// * `img` - Source image
/// * `width` - Maximum width (optional)
/// * `height` - Maximum height (optional)
///
/// # Behavior
/// - Both bounds: the tighter ratio wins, so the result fits inside the box
/// - One bound: the other dimension scales proportionally
/// - Neither, or an image already inside the bounds: returned unchanged
///
/// Never upscales. Each output dimension is at least 1 pixel.
pub fn resize_to_fit(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    let (orig_w, orig_h) = img.dimensions();
    if orig_w == 0 || orig_h == 0 {
        return img;
    }

    let ratio_w = width.map(|w| w as f64 / orig_w as f64).unwrap_or(f64::INFINITY);
    let ratio_h = height.map(|h| h as f64 / orig_h as f64).unwrap_or(f64::INFINITY);
    let ratio = ratio_w.min(ratio_h);
    if ratio >= 1.0 {
        return img;
    }

    let target_w = ((orig_w as f64 * ratio).round() as u32).clamp(1, orig_w);
    let target_h = ((orig_h as f64 * ratio).round() as u32).clamp(1, orig_h);
    img.resize_exact(target_w, target_h, FilterType::Lanczos3)
}

/// Encodes `img` to `format`.
///
/// Format-specific encoding:
/// - **JPEG**: RGB, alpha dropped
/// - **PNG**: RGB or RGBA, best compression with adaptive filtering
/// - **WebP**: lossy via libwebp, alpha kept when present
///
/// # Parameters
/// * `img` - Image to encode
/// * `format` - Target output format
/// * `quality` - 1-100, clamped; ignored for PNG
///
/// # Errors
/// Returns `TransformError::Encode` on encoder failures.
pub fn encode_image(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, TransformError> {
    let q = quality.clamp(1, 100);
    let mut out = Vec::new();

    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, q)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        OutputFormat::Png => {
            let enc = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
            let written = if img.color().has_alpha() {
                let rgba = img.to_rgba8();
                let (w, h) = rgba.dimensions();
                enc.write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
            } else {
                let rgb = img.to_rgb8();
                let (w, h) = rgb.dimensions();
                enc.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
            };
            written.map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        OutputFormat::WebP => {
            let encoded = if img.color().has_alpha() {
                let rgba = img.to_rgba8();
                let (w, h) = rgba.dimensions();
                webp::Encoder::from_rgba(rgba.as_raw(), w, h).encode(q as f32)
            } else {
                let rgb = img.to_rgb8();
                let (w, h) = rgb.dimensions();
                webp::Encoder::from_rgb(rgb.as_raw(), w, h).encode(q as f32)
            };
            out.extend_from_slice(&encoded);
        }
    }

    Ok(out)
}

/// Decode, fit within `target`, re-encode in the source's output format.
pub fn try_transform(bytes: &[u8], declared: &str, target: Target) -> Result<Transformed, TransformError> {
    let (img, source_format) = decode_image(bytes, declared)?;
    let format = OutputFormat::for_source(source_format);
    let resized = resize_to_fit(img, target.width, target.height);
    let encoded = encode_image(&resized, format, target.quality)?;
    Ok(Transformed {
        bytes: Bytes::from(encoded),
        content_type: format.content_type().to_string(),
        transformed: true,
    })
}

/// The input, unmodified.
pub fn passthrough(bytes: &Bytes, declared: &str) -> Transformed {
    Transformed {
        bytes: bytes.clone(),
        content_type: passthrough_content_type(bytes, declared),
        transformed: false,
    }
}

/// Infallible pipeline boundary: `original` passes through, and any failure
/// degrades to the untouched input rather than an error.
pub fn transform(bytes: &Bytes, declared: &str, descriptor: &ResolutionDescriptor) -> Transformed {
    let Some(target) = descriptor.target() else {
        return passthrough(bytes, declared);
    };

    match try_transform(bytes, declared, target) {
        Ok(out) => {
            tracing::debug!(
                "Transformed {} -> {} bytes ({}, {})",
                bytes.len(),
                out.bytes.len(),
                descriptor,
                out.content_type
            );
            out
        }
        Err(e) => {
            tracing::warn!("Transform failed for {} ({} bytes), serving original: {}", descriptor, bytes.len(), e);
            passthrough(bytes, declared)
        }
    }
}
