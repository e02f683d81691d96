//! Multi-card (collage) detection.
//!
//! Collages are caught two ways: grossly non-card aspect ratios, and a
//! vertical-edge density scan. Cards placed side by side produce strong
//! vertical boundaries in the middle of the frame, which show up as
//! columns of high Sobel response.

use image::imageops::FilterType;
use tracing::debug;

use crate::decoder::ImageMetadata;

const MAX_SINGLE_CARD_ASPECT: f64 = 1.5;
const MIN_SINGLE_CARD_ASPECT: f64 = 0.4;

/// Downscale width for the edge scan.
const SCAN_WIDTH: u32 = 200;
/// Mean per-column gradient magnitude that marks a strong edge column.
const STRONG_COLUMN_THRESHOLD: f64 = 100.0;
/// Fraction of strong columns in the middle band that flags a collage.
const EDGE_RATIO_THRESHOLD: f64 = 0.15;

/// Decide whether `bytes` depicts more than one card. Failures are treated
/// as "not a collage" so a bad scan never blocks ingestion on its own.
pub fn detect_collage(bytes: &[u8], metadata: &ImageMetadata) -> bool {
    let aspect = metadata.width as f64 / metadata.height as f64;
    if aspect > MAX_SINGLE_CARD_ASPECT || aspect < MIN_SINGLE_CARD_ASPECT {
        debug!(aspect, "aspect ratio outside single-card range");
        return true;
    }

    match edge_ratio(bytes, aspect) {
        Ok(ratio) => {
            debug!(ratio, "vertical edge density");
            ratio > EDGE_RATIO_THRESHOLD
        }
        Err(reason) => {
            debug!(%reason, "collage scan failed, assuming single card");
            false
        }
    }
}

/// Fraction of middle-band columns whose mean vertical-edge magnitude
/// exceeds the strong-column threshold.
fn edge_ratio(bytes: &[u8], aspect: f64) -> Result<f64, String> {
    let scan_height = (SCAN_WIDTH as f64 / aspect).round() as u32;
    if scan_height < 3 {
        return Err("degenerate scan height".to_string());
    }

    let gray = image::load_from_memory(bytes)
        .map_err(|e| e.to_string())?
        .resize_exact(SCAN_WIDTH, scan_height, FilterType::Triangle)
        .to_luma8();

    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let px = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32).0[0] as i32;

    // Middle 60% of columns; the frame edges of a single card would
    // otherwise count against it.
    let band_start = (0.2 * width as f64) as usize;
    let band_end = (0.8 * width as f64) as usize;
    let band_width = band_end - band_start;
    if band_width == 0 {
        return Err("empty middle band".to_string());
    }

    let mut strong_columns = 0usize;
    for x in band_start..band_end {
        if x == 0 || x + 1 >= width {
            continue;
        }
        let mut sum = 0.0;
        let mut rows = 0u32;
        for y in 1..height.saturating_sub(1) {
            // 3x3 vertical Sobel: [[-1,0,1],[-2,0,2],[-1,0,1]]
            let gx = -px(x - 1, y - 1) + px(x + 1, y - 1) - 2 * px(x - 1, y)
                + 2 * px(x + 1, y)
                - px(x - 1, y + 1)
                + px(x + 1, y + 1);
            sum += gx.abs() as f64;
            rows += 1;
        }
        if rows > 0 && sum / rows as f64 > STRONG_COLUMN_THRESHOLD {
            strong_columns += 1;
        }
    }

    Ok(strong_columns as f64 / band_width as f64)
}
