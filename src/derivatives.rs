//! Derivative generation.
//!
//! Every stored image gets three WebP variants at bounded widths. The
//! source is decoded once, converted into a `fast_image_resize` buffer,
//! and resized per variant. Variants are never upscaled past the original
//! width.

use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use webp::Encoder;

use crate::hashing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Thumb,
    Grid,
    Detail,
}

impl Variant {
    /// Generation order is fixed; catalog rows and storage keys follow it.
    pub const ALL: [Variant; 3] = [Variant::Thumb, Variant::Grid, Variant::Detail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Thumb => "thumb",
            Variant::Grid => "grid",
            Variant::Detail => "detail",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VariantSettings {
    pub width: u32,
    pub quality: f32,
}

/// Target widths and WebP qualities per variant.
#[derive(Debug, Clone)]
pub struct DerivativeConfig {
    pub thumb: VariantSettings,
    pub grid: VariantSettings,
    pub detail: VariantSettings,
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            thumb: VariantSettings {
                width: 160,
                quality: 75.0,
            },
            grid: VariantSettings {
                width: 360,
                quality: 80.0,
            },
            detail: VariantSettings {
                width: 960,
                quality: 80.0,
            },
        }
    }
}

impl DerivativeConfig {
    pub fn settings_for(&self, variant: Variant) -> VariantSettings {
        match variant {
            Variant::Thumb => self.thumb,
            Variant::Grid => self.grid,
            Variant::Detail => self.detail,
        }
    }
}

/// One generated size variant, ready for upload.
#[derive(Debug, Clone)]
pub struct Derivative {
    pub variant: Variant,
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub storage_path: String,
}

#[derive(Debug, Error)]
pub enum DerivativeError {
    #[error("failed to decode source image: {0}")]
    Decode(String),
    #[error("failed to resize {variant} variant: {reason}")]
    Resize {
        variant: &'static str,
        reason: String,
    },
}

/// Produce all three variants in order. The first failure aborts the run;
/// a partially derived image is never uploaded.
pub fn generate_derivatives(
    bytes: &[u8],
    sha256: &str,
    config: &DerivativeConfig,
) -> Result<Vec<Derivative>, DerivativeError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| DerivativeError::Decode(e.to_string()))?;
    let (src_width, src_height) = (decoded.width(), decoded.height());

    let (src, pixel_type) = to_resize_image(decoded)?;
    let mut resizer = Resizer::new();

    let mut derivatives = Vec::with_capacity(Variant::ALL.len());
    for variant in Variant::ALL {
        let settings = config.settings_for(variant);
        let target_width = settings.width.min(src_width);
        let target_height =
            ((src_height as f64 * target_width as f64 / src_width as f64).round() as u32).max(1);

        let webp = if target_width == src_width && target_height == src_height {
            encode_webp(src.buffer(), target_width, target_height, pixel_type, settings.quality)
        } else {
            let mut dst = Image::new(target_width, target_height, pixel_type);
            resizer
                .resize(
                    &src,
                    &mut dst,
                    &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
                )
                .map_err(|e| DerivativeError::Resize {
                    variant: variant.as_str(),
                    reason: e.to_string(),
                })?;
            encode_webp(dst.buffer(), target_width, target_height, pixel_type, settings.quality)
        };

        derivatives.push(Derivative {
            variant,
            bytes: webp.len(),
            width: target_width,
            height: target_height,
            storage_path: hashing::derivative_path(sha256, variant.as_str()),
            buffer: webp,
        });
    }

    Ok(derivatives)
}

fn to_resize_image(decoded: DynamicImage) -> Result<(Image<'static>, PixelType), DerivativeError> {
    let (w, h) = (decoded.width(), decoded.height());
    match decoded {
        DynamicImage::ImageRgba8(rgba) => Image::from_vec_u8(w, h, rgba.into_raw(), PixelType::U8x4)
            .map(|img| (img, PixelType::U8x4))
            .map_err(|e| DerivativeError::Decode(e.to_string())),
        other => {
            let rgb = other.to_rgb8();
            Image::from_vec_u8(w, h, rgb.into_raw(), PixelType::U8x3)
                .map(|img| (img, PixelType::U8x3))
                .map_err(|e| DerivativeError::Decode(e.to_string()))
        }
    }
}

fn encode_webp(pixels: &[u8], width: u32, height: u32, pixel_type: PixelType, quality: f32) -> Vec<u8> {
    let encoded = match pixel_type {
        PixelType::U8x4 => Encoder::from_rgba(pixels, width, height).encode(quality),
        _ => Encoder::from_rgb(pixels, width, height).encode(quality),
    };
    encoded.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const SHA: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn variants_come_out_in_fixed_order_with_capped_widths() {
        let bytes = png_bytes(734, 1024);
        let derivatives = generate_derivatives(&bytes, SHA, &DerivativeConfig::default()).unwrap();

        let summary: Vec<(Variant, u32)> = derivatives.iter().map(|d| (d.variant, d.width)).collect();
        // detail target 960 is capped by the 734px original.
        assert_eq!(
            summary,
            vec![(Variant::Thumb, 160), (Variant::Grid, 360), (Variant::Detail, 734)]
        );

        // Heights keep the source aspect.
        assert_eq!(derivatives[0].height, 223);
        assert_eq!(derivatives[1].height, 502);
        assert_eq!(derivatives[2].height, 1024);
    }

    #[test]
    fn small_originals_are_never_upscaled() {
        let bytes = png_bytes(100, 140);
        let derivatives = generate_derivatives(&bytes, SHA, &DerivativeConfig::default()).unwrap();
        for d in &derivatives {
            assert_eq!(d.width, 100);
            assert_eq!(d.height, 140);
        }
    }

    #[test]
    fn buffers_are_webp_with_sharded_paths() {
        let bytes = png_bytes(320, 440);
        let derivatives = generate_derivatives(&bytes, SHA, &DerivativeConfig::default()).unwrap();

        for d in &derivatives {
            assert_eq!(&d.buffer[0..4], b"RIFF");
            assert_eq!(&d.buffer[8..12], b"WEBP");
            assert_eq!(d.bytes, d.buffer.len());
            assert_eq!(
                d.storage_path,
                format!("derivatives/ba/{}/{}.webp", SHA, d.variant)
            );
        }
    }

    #[test]
    fn undecodable_input_fails() {
        let err = generate_derivatives(b"not an image", SHA, &DerivativeConfig::default());
        assert!(matches!(err, Err(DerivativeError::Decode(_))));
    }
}
