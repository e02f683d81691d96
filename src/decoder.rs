//! Image metadata validation.
//!
//! Reads dimensions and format from the container header without decoding
//! pixel data; the pixel budget gate runs before any full decode happens
//! downstream.

use std::io::Cursor;

use image::ImageReader;
use thiserror::Error;

/// Validated metadata for a fetched image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: usize,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unable to determine image format")]
    UnknownFormat,
    #[error("Unable to read image dimensions: {0}")]
    MissingDimensions(String),
    #[error("Image exceeds pixel budget: {pixels} > {max}")]
    TooManyPixels { pixels: u64, max: u64 },
}

/// Validate `bytes` and return its metadata. Rejects images whose
/// dimensions cannot be read or whose pixel count exceeds `max_pixels`.
pub fn read_metadata(bytes: &[u8], max_pixels: u64) -> Result<ImageMetadata, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::MissingDimensions(e.to_string()))?;

    let format = reader.format().ok_or(DecodeError::UnknownFormat)?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| DecodeError::MissingDimensions(e.to_string()))?;
    if width == 0 || height == 0 {
        return Err(DecodeError::MissingDimensions(
            "zero-sized image".to_string(),
        ));
    }

    let pixels = width as u64 * height as u64;
    if pixels > max_pixels {
        return Err(DecodeError::TooManyPixels {
            pixels,
            max: max_pixels,
        });
    }

    Ok(ImageMetadata {
        width,
        height,
        format: format.extensions_str()[0].to_string(),
        size_bytes: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn reads_dimensions_and_format() {
        let bytes = png_bytes(40, 56);
        let meta = read_metadata(&bytes, 20_000_000).unwrap();
        assert_eq!(meta.width, 40);
        assert_eq!(meta.height, 56);
        assert_eq!(meta.format, "png");
        assert_eq!(meta.size_bytes, bytes.len());
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let err = read_metadata(b"definitely not an image", 20_000_000).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFormat));
    }

    #[test]
    fn rejects_images_over_pixel_budget() {
        let bytes = png_bytes(100, 100);
        let err = read_metadata(&bytes, 9_999).unwrap_err();
        match err {
            DecodeError::TooManyPixels { pixels, max } => {
                assert_eq!(pixels, 10_000);
                assert_eq!(max, 9_999);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
