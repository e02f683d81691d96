//! Heuristic front/back classification.
//!
//! Cards are portrait 63:88; fronts carry a yellow border and a busy,
//! multi-hued face, while card backs are dominated by the blue back
//! pattern. The detector scores the outer border ring of a downscaled
//! copy and maps the score to a side with a confidence.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoder::ImageMetadata;

/// Expected width/height ratio of a card scan.
const CARD_ASPECT: f64 = 0.716;
const ASPECT_TOLERANCE: f64 = 0.08;

/// Downscale target for colorimetry; the ring is the outer 10%.
const SAMPLE_SIZE: u32 = 64;
const BORDER_WIDTH: u32 = SAMPLE_SIZE / 10;

const HUE_BUCKETS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Front,
    Back,
    Unknown,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Front => write!(f, "front"),
            Side::Back => write!(f, "back"),
            Side::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = ();

    /// Catalog rows store sides as lowercase strings; anything else reads
    /// back as unknown rather than erroring.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "front" => Side::Front,
            "back" => Side::Back,
            _ => Side::Unknown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Heuristic,
    Vision,
    Manual,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Heuristic => write!(f, "heuristic"),
            DetectionMethod::Vision => write!(f, "vision"),
            DetectionMethod::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SideDetectionResult {
    pub side: Side,
    pub confidence: f64,
    pub method: DetectionMethod,
}

impl SideDetectionResult {
    pub fn unknown(method: DetectionMethod) -> Self {
        Self {
            side: Side::Unknown,
            confidence: 0.5,
            method,
        }
    }
}

/// Classify the image as a card front or back. Never fails: anything the
/// scorer cannot handle comes back as `{unknown, 0.5, heuristic}`.
pub fn detect_side(bytes: &[u8], metadata: &ImageMetadata) -> SideDetectionResult {
    match score_image(bytes, metadata) {
        Ok(score) => {
            let result = if score >= 0.3 {
                SideDetectionResult {
                    side: Side::Front,
                    confidence: (0.5 + score).min(0.95),
                    method: DetectionMethod::Heuristic,
                }
            } else if score <= -0.3 {
                SideDetectionResult {
                    side: Side::Back,
                    confidence: (0.5 + score.abs()).min(0.95),
                    method: DetectionMethod::Heuristic,
                }
            } else {
                SideDetectionResult::unknown(DetectionMethod::Heuristic)
            };
            debug!(score, side = %result.side, confidence = result.confidence, "side heuristic");
            result
        }
        Err(reason) => {
            debug!(%reason, "side heuristic failed, returning unknown");
            SideDetectionResult::unknown(DetectionMethod::Heuristic)
        }
    }
}

fn score_image(bytes: &[u8], metadata: &ImageMetadata) -> Result<f64, String> {
    let mut score = 0.0;

    let aspect = metadata.width as f64 / metadata.height as f64;
    if (aspect - CARD_ASPECT).abs() <= ASPECT_TOLERANCE {
        score += 0.2;
    }

    let decoded = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let sample = decoded
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle)
        .to_rgb8();

    let mut total = 0u32;
    let mut blue = 0u32;
    let mut yellow = 0u32;
    let mut histogram = [0u32; HUE_BUCKETS];

    for (x, y, pixel) in sample.enumerate_pixels() {
        if !in_border_ring(x, y) {
            continue;
        }
        total += 1;

        let [r, g, b] = pixel.0;
        let (rf, gf, bf) = (r as f64, g as f64, b as f64);

        if bf > 120.0 && bf > 1.5 * rf && bf > 1.2 * gf {
            blue += 1;
        }
        if rf > 180.0 && gf > 150.0 && bf < 100.0 {
            yellow += 1;
        }

        let bucket = (hue_degrees(rf, gf, bf) / 30.0) as usize % HUE_BUCKETS;
        histogram[bucket] += 1;
    }

    if total == 0 {
        return Err("empty border ring".to_string());
    }

    let blue_ratio = blue as f64 / total as f64;
    let yellow_ratio = yellow as f64 / total as f64;
    let dominant = *histogram.iter().max().unwrap_or(&0);

    let is_blue_back = blue_ratio > 0.5;
    let has_yellow_border = yellow_ratio > 0.3;
    let has_varied_colors = (dominant as f64) < 0.4 * total as f64;

    if is_blue_back {
        score -= 0.6;
    } else if has_yellow_border {
        score += 0.3;
    } else if has_varied_colors {
        score += 0.2;
    }

    Ok(score)
}

fn in_border_ring(x: u32, y: u32) -> bool {
    x < BORDER_WIDTH
        || x >= SAMPLE_SIZE - BORDER_WIDTH
        || y < BORDER_WIDTH
        || y >= SAMPLE_SIZE - BORDER_WIDTH
}

/// HSV hue in degrees via the standard max/min/delta formula.
fn hue_degrees(r: f64, g: f64, b: f64) -> f64 {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta == 0.0 {
        return 0.0;
    }

    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    if hue < 0.0 {
        hue + 360.0
    } else {
        hue
    }
}
