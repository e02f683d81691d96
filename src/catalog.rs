//! Catalog gateway.
//!
//! A narrow trait over the relational catalog so the pipeline can run
//! against Postgres in production and an in-memory fake in tests. The
//! Postgres implementation holds one `PgPool` per process and owns no
//! other state.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::derivatives::Variant;
use crate::events::IngestEvent;
use crate::side_detector::{DetectionMethod, Side};

/// Role under which this pipeline assigns images to cards.
pub const ROLE_PRIMARY_FRONT: &str = "primary_front";

/// A configured image source.
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub trust_tier: i16,
    pub max_rps: i32,
    pub max_concurrency: i32,
    pub is_allowed: bool,
}

/// Lifecycle status of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Processing => "processing",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
        }
    }
}

/// Dedup probe result: the stored image and how it was classified.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: Uuid,
    pub detected_side: Side,
}

/// Fields for a new image row; rows are created in `processing` status.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub sha256: String,
    pub original_mime: String,
    pub original_width: u32,
    pub original_height: u32,
    pub original_bytes: usize,
    pub detected_side: Side,
    pub side_confidence: f64,
    pub is_collage: bool,
    pub detected_method: DetectionMethod,
}

/// Upsert payload for a card-image assignment, unique on `(card_id, role)`.
#[derive(Debug, Clone)]
pub struct CardAssignment {
    pub card_id: String,
    pub image_id: Uuid,
    pub role: String,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Unique violation on `images.sha256`: a concurrent job inserted the
    /// same bytes first.
    #[error("image with this sha256 already exists")]
    DuplicateImage,
    #[error("catalog query failed: {0}")]
    Query(#[from] sqlx::Error),
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Dedup probe. Absence is a normal outcome, not an error.
    async fn find_image_by_sha256(&self, sha256: &str) -> Result<Option<StoredImage>, CatalogError>;

    async fn image_source(&self, id: &str) -> Result<Option<ImageSource>, CatalogError>;

    async fn image_source_by_name(&self, name: &str) -> Result<Option<ImageSource>, CatalogError>;

    async fn create_image_record(&self, image: &NewImage) -> Result<Uuid, CatalogError>;

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        error: Option<&str>,
    ) -> Result<(), CatalogError>;

    #[allow(clippy::too_many_arguments)]
    async fn create_derivative_record(
        &self,
        image_id: Uuid,
        variant: Variant,
        format: &str,
        width: u32,
        height: u32,
        bytes: usize,
        storage_path: &str,
    ) -> Result<(), CatalogError>;

    async fn assign_image_to_card(&self, assignment: &CardAssignment) -> Result<(), CatalogError>;

    /// Fire-and-forget event append. Failures are logged and swallowed;
    /// the event log must never shadow a job's real outcome.
    async fn log_ingest_event(&self, event: IngestEvent);
}

/// Postgres-backed catalog.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn find_image_by_sha256(&self, sha256: &str) -> Result<Option<StoredImage>, CatalogError> {
        let row = sqlx::query("SELECT id, detected_side FROM images WHERE sha256 = $1")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| StoredImage {
            id: row.get("id"),
            detected_side: row
                .get::<Option<String>, _>("detected_side")
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Side::Unknown),
        }))
    }

    async fn image_source(&self, id: &str) -> Result<Option<ImageSource>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, name, base_url, trust_tier, max_rps, max_concurrency, is_allowed \
             FROM image_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(source_from_row))
    }

    async fn image_source_by_name(&self, name: &str) -> Result<Option<ImageSource>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, name, base_url, trust_tier, max_rps, max_concurrency, is_allowed \
             FROM image_sources WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(source_from_row))
    }

    async fn create_image_record(&self, image: &NewImage) -> Result<Uuid, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO images \
             (sha256, original_mime, original_width, original_height, original_bytes, \
              status, detected_side, side_confidence, is_collage, detected_method, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now()) \
             RETURNING id",
        )
        .bind(&image.sha256)
        .bind(&image.original_mime)
        .bind(image.original_width as i32)
        .bind(image.original_height as i32)
        .bind(image.original_bytes as i64)
        .bind(ImageStatus::Processing.as_str())
        .bind(image.detected_side.to_string())
        .bind(image.side_confidence)
        .bind(image.is_collage)
        .bind(image.detected_method.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false)
            {
                CatalogError::DuplicateImage
            } else {
                CatalogError::Query(e)
            }
        })?;

        Ok(row.get("id"))
    }

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        error: Option<&str>,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE images SET status = $2, error = $3, updated_at = now() WHERE id = $1")
            .bind(image_id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_derivative_record(
        &self,
        image_id: Uuid,
        variant: Variant,
        format: &str,
        width: u32,
        height: u32,
        bytes: usize,
        storage_path: &str,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO image_derivatives \
             (image_id, variant, format, width, height, bytes, storage_path) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (image_id, variant) DO UPDATE SET \
               format = EXCLUDED.format, width = EXCLUDED.width, \
               height = EXCLUDED.height, bytes = EXCLUDED.bytes, \
               storage_path = EXCLUDED.storage_path",
        )
        .bind(image_id)
        .bind(variant.as_str())
        .bind(format)
        .bind(width as i32)
        .bind(height as i32)
        .bind(bytes as i64)
        .bind(storage_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn assign_image_to_card(&self, assignment: &CardAssignment) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO card_images \
             (card_id, image_id, role, source_id, source_url, assigned_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (card_id, role) DO UPDATE SET \
               image_id = EXCLUDED.image_id, source_id = EXCLUDED.source_id, \
               source_url = EXCLUDED.source_url, assigned_at = now()",
        )
        .bind(&assignment.card_id)
        .bind(assignment.image_id)
        .bind(&assignment.role)
        .bind(&assignment.source_id)
        .bind(&assignment.source_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_ingest_event(&self, event: IngestEvent) {
        let result = sqlx::query(
            "INSERT INTO image_ingest_events \
             (card_id, candidate_id, image_id, event_type, message, http_status, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&event.card_id)
        .bind(&event.candidate_id)
        .bind(event.image_id)
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(event.http_status.map(|s| s as i32))
        .bind(&event.metadata)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(event_type = %event.event_type, error = %e, "failed to log ingest event");
        }
    }
}

fn source_from_row(row: sqlx::postgres::PgRow) -> ImageSource {
    ImageSource {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        trust_tier: row.get("trust_tier"),
        max_rps: row.get("max_rps"),
        max_concurrency: row.get("max_concurrency"),
        is_allowed: row.get("is_allowed"),
    }
}
