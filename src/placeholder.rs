use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use lazy_static::lazy_static;
use std::io::Cursor;

pub const PLACEHOLDER_CONTENT_TYPE: &str = "image/png";

const SIZE: u32 = 16;
const FILL: Rgb<u8> = Rgb([229, 231, 235]);

lazy_static! {
    /// Neutral grey square served whenever a real image cannot be produced.
    static ref PLACEHOLDER: Bytes = render();
}

fn render() -> Bytes {
    let img = RgbImage::from_pixel(SIZE, SIZE, FILL);
    let mut out = Vec::new();
    match img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png) {
        Ok(()) => Bytes::from(out),
        Err(e) => {
            // Encoding a fixed in-memory image should not fail; an empty body
            // still carries the short-lived headers.
            tracing::error!("Failed to render placeholder: {}", e);
            Bytes::new()
        }
    }
}

pub fn placeholder_bytes() -> Bytes {
    PLACEHOLDER.clone()
}
