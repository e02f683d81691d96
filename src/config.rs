//! Worker configuration.
//!
//! All tunables come from the environment at startup and are carried in a
//! single `WorkerConfig` handed to the pipeline. Nothing reads env vars
//! after bootstrap.

use std::time::Duration;

use anyhow::{anyhow, Result};

/// Process-wide configuration for the ingest worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string for the catalog.
    pub database_url: String,
    /// Base URL of the blob store (Supabase project URL).
    pub storage_url: String,
    /// Service-role key used for blob uploads.
    pub storage_key: String,
    /// Bucket that receives derivative objects.
    pub storage_bucket: String,
    /// OpenRouter key; vision checks are skipped when absent.
    pub openrouter_api_key: Option<String>,
    /// Chat-completions endpoint base.
    pub vision_base_url: String,
    /// Multimodal model id sent to OpenRouter.
    pub vision_model: String,
    /// Reject images with more pixels than this.
    pub max_image_pixels: u64,
    /// Reject fetched payloads larger than this.
    pub max_fetch_bytes: usize,
    /// Absolute deadline for one source fetch.
    pub fetch_timeout: Duration,
    /// Assignment gate: minimum side confidence for `primary_front`.
    pub min_confidence_for_assignment: f64,
    /// Tier-2 vision band: always check when confidence is in
    /// `[lower, upper)`.
    pub vision_check_lower_bound: f64,
    pub vision_check_upper_bound: f64,
    /// Tier-2 out-of-band sampling probability.
    pub vision_sample_rate: f64,
    /// Idle period after which rate-limit buckets are swept.
    pub bucket_gc_interval: Duration,
    /// When true, a dedup hit only assigns `primary_front` if the stored
    /// image was classified as a front. Off by default: a dedup hit
    /// re-assigns whatever the prior ingestion stored.
    pub require_front_on_dedup: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/bourdain".to_string(),
            storage_url: "http://localhost:54321".to_string(),
            storage_key: String::new(),
            storage_bucket: "card-images".to_string(),
            openrouter_api_key: None,
            vision_base_url: "https://openrouter.ai/api/v1".to_string(),
            vision_model: "google/gemini-2.5-flash-preview".to_string(),
            max_image_pixels: 20_000_000,
            max_fetch_bytes: 20 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
            min_confidence_for_assignment: 0.85,
            vision_check_lower_bound: 0.6,
            vision_check_upper_bound: 0.9,
            vision_sample_rate: 0.1,
            bucket_gc_interval: Duration::from_secs(60),
            require_front_on_dedup: false,
        }
    }
}

impl WorkerConfig {
    /// Build the config from the process environment. `DATABASE_URL`,
    /// `SUPABASE_URL` and `SUPABASE_SERVICE_KEY` are required; everything
    /// else falls back to production defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            storage_url: require("SUPABASE_URL")?,
            storage_key: require("SUPABASE_SERVICE_KEY")?,
            storage_bucket: env_or("STORAGE_BUCKET", defaults.storage_bucket),
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            vision_base_url: env_or("VISION_BASE_URL", defaults.vision_base_url),
            vision_model: env_or("VISION_MODEL", defaults.vision_model),
            max_image_pixels: env_parsed("MAX_IMAGE_PIXELS", defaults.max_image_pixels)?,
            max_fetch_bytes: env_parsed("MAX_FETCH_BYTES", defaults.max_fetch_bytes)?,
            fetch_timeout: Duration::from_secs(env_parsed(
                "FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            min_confidence_for_assignment: env_parsed(
                "MIN_CONFIDENCE_FOR_ASSIGNMENT",
                defaults.min_confidence_for_assignment,
            )?,
            vision_check_lower_bound: env_parsed(
                "VISION_CHECK_LOWER_BOUND",
                defaults.vision_check_lower_bound,
            )?,
            vision_check_upper_bound: env_parsed(
                "VISION_CHECK_UPPER_BOUND",
                defaults.vision_check_upper_bound,
            )?,
            vision_sample_rate: env_parsed("VISION_SAMPLE_RATE", defaults.vision_sample_rate)?,
            bucket_gc_interval: Duration::from_secs(env_parsed(
                "BUCKET_GC_INTERVAL_SECS",
                defaults.bucket_gc_interval.as_secs(),
            )?),
            require_front_on_dedup: env_parsed(
                "REQUIRE_FRONT_ON_DEDUP",
                defaults.require_front_on_dedup,
            )?,
        })
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("{} must be set", key))
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}
