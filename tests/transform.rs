use bytes::Bytes;
use image::GenericImageView;
use image_proxy::resolution::{Preset, ResolutionDescriptor};
use image_proxy::transform::{decode_image, encode_image, resize_to_fit, transform, OutputFormat};

fn encoded(img: &image::DynamicImage, format: image::ImageFormat) -> Bytes {
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), format).unwrap();
    Bytes::from(out)
}

#[test]
fn resize_and_encode_jpeg() {
    let img = image::DynamicImage::new_rgb8(800, 600);
    let resized = resize_to_fit(img, Some(400), None);
    assert_eq!(resized.dimensions(), (400, 300));
    let out = encode_image(&resized, OutputFormat::Jpeg, 80).unwrap();
    assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::Jpeg);
}

#[test]
fn decode_then_webp() {
    let png = encoded(&image::DynamicImage::new_rgba8(64, 64), image::ImageFormat::Png);
    let (decoded, format) = decode_image(&png, "image/png").unwrap();
    assert_eq!(format, image::ImageFormat::Png);
    let out = encode_image(&decoded, OutputFormat::WebP, 85).unwrap();
    assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::WebP);
}

#[test]
fn webp_source_stays_webp() {
    let webp = encode_image(&image::DynamicImage::new_rgb8(1200, 600), OutputFormat::WebP, 90).unwrap();
    let out = transform(&Bytes::from(webp), "image/webp", &ResolutionDescriptor::Preset(Preset::Small));
    assert!(out.transformed);
    assert_eq!(out.content_type, "image/webp");
    let img = image::load_from_memory(&out.bytes).unwrap();
    assert_eq!(img.dimensions(), (400, 200));
}

#[test]
fn gif_source_becomes_jpeg() {
    let gif = encoded(&image::DynamicImage::new_rgba8(300, 300), image::ImageFormat::Gif);
    let out = transform(&gif, "image/gif", &ResolutionDescriptor::Preset(Preset::Thumbnail));
    assert!(out.transformed);
    assert_eq!(out.content_type, "image/jpeg");
    let img = image::load_from_memory(&out.bytes).unwrap();
    assert_eq!(img.dimensions(), (200, 200));
}

#[test]
fn height_only_bound_keeps_aspect() {
    let png = encoded(&image::DynamicImage::new_rgb8(600, 900), image::ImageFormat::Png);
    let descriptor = ResolutionDescriptor::Custom { width: None, height: Some(300), quality: 85 };
    let out = transform(&png, "image/png", &descriptor);
    assert_eq!(out.content_type, "image/png");
    let img = image::load_from_memory(&out.bytes).unwrap();
    assert_eq!(img.dimensions(), (200, 300));
}

#[test]
fn mislabelled_bytes_are_sniffed() {
    let png = encoded(&image::DynamicImage::new_rgb8(1000, 500), image::ImageFormat::Png);
    let out = transform(&png, "application/octet-stream", &ResolutionDescriptor::Preset(Preset::Medium));
    assert!(out.transformed);
    assert_eq!(out.content_type, "image/png");
    let img = image::load_from_memory(&out.bytes).unwrap();
    assert_eq!(img.dimensions(), (800, 400));
}

#[test]
fn garbage_passes_through_unchanged() {
    let junk = Bytes::from_static(b"definitely not an image");
    let out = transform(&junk, "image/jpeg", &ResolutionDescriptor::Preset(Preset::Large));
    assert!(!out.transformed);
    assert_eq!(out.bytes, junk);
    assert_eq!(out.content_type, "image/jpeg");
}
