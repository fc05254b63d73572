//! Image encoding for page images.
//!
//! Two directions: source scans of any supported format are normalised to
//! PNG at intake ([`png_bytes`]), and staged PNGs are wrapped as base64
//! `ImageData` for the vision OCR engine ([`encode_page`]).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Lossless PNG bytes of `img`, converted to RGB8 first so every staged
/// page has the same pixel layout regardless of its source format.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Decode image bytes of any enabled format.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Encode a page as a base64 PNG ready for a vision model, with
/// `detail: "high"` so small print survives tiling.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn red_square() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_small_image() {
        let data = encode_page(&red_square()).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(!decoded.is_empty());
    }

    #[test]
    fn png_bytes_normalise_to_rgb() {
        let bytes = png_bytes(&red_square()).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        let back = decode(&bytes).unwrap();
        assert_eq!(back.dimensions(), (10, 10));
        assert!(matches!(back, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"definitely not an image").is_err());
    }
}
