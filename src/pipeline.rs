//! The ingest pipeline.
//!
//! One job in, one result out: rate limit, fetch, dedup probe, validate,
//! classify, derive, upload, record. Stages run strictly in order; each
//! consumes the previous stage's output. Network stages await; CPU-bound
//! image work is pushed onto the blocking pool.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{
    CardAssignment, Catalog, CatalogError, ImageSource, ImageStatus, NewImage, ROLE_PRIMARY_FRONT,
};
use crate::collage_detector::detect_collage;
use crate::config::WorkerConfig;
use crate::decoder::read_metadata;
use crate::derivatives::{generate_derivatives, DerivativeConfig};
use crate::events::{EventType, IngestEvent};
use crate::fetcher::ImageFetcher;
use crate::hashing;
use crate::rate_limiter::RateLimiter;
use crate::side_detector::{detect_side, Side, SideDetectionResult};
use crate::storage::BlobStore;
use crate::vision::{should_run_vision_check, VisionChecker, VisionPolicy};

/// One unit of ingest work: which card, and where to fetch its image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJob {
    pub card_id: String,
    pub source_url: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    /// Fallback trust tier when the source cannot be resolved.
    #[serde(default)]
    pub trust_tier: Option<u8>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default)]
    pub set_code: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Completed,
    Failed,
    Deduplicated,
    Rejected,
    RateLimited,
}

/// Outcome of one job, returned to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_side: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ProcessStatus::Failed,
            image_id: None,
            sha256: None,
            detected_side: None,
            confidence: None,
            error: Some(error.into()),
        }
    }

    fn rate_limited(error: String) -> Self {
        Self {
            status: ProcessStatus::RateLimited,
            image_id: None,
            sha256: None,
            detected_side: None,
            confidence: None,
            error: Some(error),
        }
    }
}

/// A stage error that escaped its stage. Carries the image row id when one
/// was already created so the row can be marked failed instead of leaking
/// in `processing` state.
#[derive(Debug)]
struct StageFailure {
    message: String,
    image_id: Option<Uuid>,
}

impl StageFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            image_id: None,
        }
    }

    fn with_image(mut self, image_id: Uuid) -> Self {
        self.image_id = Some(image_id);
        self
    }
}

impl From<CatalogError> for StageFailure {
    fn from(e: CatalogError) -> Self {
        StageFailure::new(e.to_string())
    }
}

/// The orchestrator. Owns the per-process rate limiter and the clients
/// for every external collaborator; transient job state lives on the
/// stack of `process_image`.
pub struct IngestPipeline {
    config: WorkerConfig,
    derivative_config: DerivativeConfig,
    fetcher: ImageFetcher,
    rate_limiter: RateLimiter,
    vision: VisionChecker,
    catalog: Arc<dyn Catalog>,
    blobs: Arc<dyn BlobStore>,
}

impl IngestPipeline {
    pub fn new(config: WorkerConfig, catalog: Arc<dyn Catalog>, blobs: Arc<dyn BlobStore>) -> Self {
        let fetcher = ImageFetcher::new(config.fetch_timeout, config.max_fetch_bytes);
        let vision = VisionChecker::new(
            config.vision_base_url.clone(),
            config.openrouter_api_key.clone(),
            config.vision_model.clone(),
        );

        Self {
            config,
            derivative_config: DerivativeConfig::default(),
            fetcher,
            rate_limiter: RateLimiter::new(),
            vision,
            catalog,
            blobs,
        }
    }

    /// The process-wide bucket map, exposed so the binary can start the
    /// idle sweeper.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Run one job through the full pipeline.
    pub async fn process_image(&self, job: ImageJob) -> ProcessResult {
        let started = Instant::now();

        match self.run(&job, started).await {
            Ok(result) => result,
            Err(failure) => {
                warn!(card_id = %job.card_id, error = %failure.message, "pipeline failed");
                if let Some(image_id) = failure.image_id {
                    if let Err(e) = self
                        .catalog
                        .update_image_status(image_id, ImageStatus::Failed, Some(&failure.message))
                        .await
                    {
                        warn!(%image_id, error = %e, "could not mark image failed");
                    }
                }
                self.catalog
                    .log_ingest_event(
                        IngestEvent::new(EventType::FetchFailed)
                            .card(&job.card_id)
                            .message(&failure.message),
                    )
                    .await;
                ProcessResult::failed(failure.message)
            }
        }
    }

    async fn run(&self, job: &ImageJob, started: Instant) -> Result<ProcessResult, StageFailure> {
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::FetchStarted)
                    .card(&job.card_id)
                    .metadata(json!({ "url": job.source_url })),
            )
            .await;

        // Source resolution drives trust and rate limiting. Jobs from
        // unresolvable sources run unlimited at the least-trusted tier.
        let source = self.resolve_source(job).await?;
        let trust_tier = source
            .as_ref()
            .map(|s| s.trust_tier.clamp(1, 3) as u8)
            .or(job.trust_tier)
            .unwrap_or(3);
        let source_name = source
            .as_ref()
            .map(|s| s.name.clone())
            .or_else(|| job.source_name.clone());
        let source_id = source
            .as_ref()
            .map(|s| s.id.clone())
            .or_else(|| job.source_id.clone());

        if let Some(source) = &source {
            self.rate_limiter
                .ensure_bucket(&source.id, source.max_rps.max(1) as u32);
            if !self.rate_limiter.try_acquire(&source.id) {
                let wait_ms = self.rate_limiter.wait_time_ms(&source.id);
                return Ok(ProcessResult::rate_limited(format!(
                    "Rate limited, retry after {}ms",
                    wait_ms
                )));
            }
        }

        let fetched = match self
            .fetcher
            .fetch(&job.source_url, source_name.as_deref())
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                self.catalog
                    .log_ingest_event(
                        IngestEvent::new(EventType::FetchFailed)
                            .card(&job.card_id)
                            .message(e.to_string())
                            .http_status(e.http_status()),
                    )
                    .await;
                return Ok(ProcessResult::failed(e.to_string()));
            }
        };
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::FetchCompleted)
                    .card(&job.card_id)
                    .metadata(json!({
                        "bytes": fetched.bytes.len(),
                        "contentType": fetched.content_type,
                    })),
            )
            .await;

        let sha256 = hashing::sha256_hex(&fetched.bytes);

        if let Some(stored) = self.catalog.find_image_by_sha256(&sha256).await? {
            return self
                .handle_dedup(job, stored.id, stored.detected_side, &sha256, source_id)
                .await;
        }

        let metadata = {
            let bytes = fetched.bytes.clone();
            let max_pixels = self.config.max_image_pixels;
            match tokio::task::spawn_blocking(move || read_metadata(&bytes, max_pixels))
                .await
                .map_err(|e| StageFailure::new(e.to_string()))?
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.catalog
                        .log_ingest_event(
                            IngestEvent::new(EventType::ValidationFailed)
                                .card(&job.card_id)
                                .message(e.to_string()),
                        )
                        .await;
                    return Ok(ProcessResult::failed(e.to_string()));
                }
            }
        };

        let (mut side_result, is_collage) = {
            let bytes = fetched.bytes.clone();
            let meta = metadata.clone();
            tokio::task::spawn_blocking(move || {
                let side = detect_side(&bytes, &meta);
                let collage = detect_collage(&bytes, &meta);
                (side, collage)
            })
            .await
            .map_err(|e| StageFailure::new(e.to_string()))?
        };

        let policy = VisionPolicy {
            lower_bound: self.config.vision_check_lower_bound,
            upper_bound: self.config.vision_check_upper_bound,
            sample_rate: self.config.vision_sample_rate,
        };
        if should_run_vision_check(trust_tier, side_result.confidence, &policy) {
            let vision_result = self
                .vision
                .check(&fetched.bytes, &fetched.content_type, job, trust_tier)
                .await;
            if vision_result.confidence > side_result.confidence {
                side_result = vision_result;
            }
        }

        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::ValidationPassed)
                    .card(&job.card_id)
                    .metadata(json!({
                        "width": metadata.width,
                        "height": metadata.height,
                        "side": side_result.side,
                        "confidence": side_result.confidence,
                        "isCollage": is_collage,
                        "method": side_result.method,
                    })),
            )
            .await;

        self.catalog
            .log_ingest_event(IngestEvent::new(EventType::ProcessingStarted).card(&job.card_id))
            .await;

        let image_id = self
            .catalog
            .create_image_record(&NewImage {
                sha256: sha256.clone(),
                original_mime: fetched.content_type.clone(),
                original_width: metadata.width,
                original_height: metadata.height,
                original_bytes: fetched.bytes.len(),
                detected_side: side_result.side,
                side_confidence: side_result.confidence,
                is_collage,
                detected_method: side_result.method,
            })
            .await?;

        let derivatives = {
            let bytes = fetched.bytes.clone();
            let sha = sha256.clone();
            let config = self.derivative_config.clone();
            tokio::task::spawn_blocking(move || generate_derivatives(&bytes, &sha, &config))
                .await
                .map_err(|e| StageFailure::new(e.to_string()).with_image(image_id))?
                .map_err(|e| StageFailure::new(e.to_string()).with_image(image_id))?
        };
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::DerivativesGenerated)
                    .card(&job.card_id)
                    .image(image_id)
                    .metadata(json!({ "count": derivatives.len() })),
            )
            .await;

        let uploads = derivatives
            .iter()
            .map(|d| self.blobs.put_object(&d.storage_path, d.buffer.clone(), "image/webp"));
        futures_util::future::try_join_all(uploads)
            .await
            .map_err(|e| StageFailure::new(e.to_string()).with_image(image_id))?;
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::UploadCompleted)
                    .card(&job.card_id)
                    .image(image_id),
            )
            .await;

        for d in &derivatives {
            self.catalog
                .create_derivative_record(
                    image_id,
                    d.variant,
                    "webp",
                    d.width,
                    d.height,
                    d.bytes,
                    &d.storage_path,
                )
                .await
                .map_err(|e| StageFailure::from(e).with_image(image_id))?;
        }

        self.catalog
            .update_image_status(image_id, ImageStatus::Completed, None)
            .await
            .map_err(|e| StageFailure::from(e).with_image(image_id))?;
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::ProcessingCompleted)
                    .card(&job.card_id)
                    .image(image_id)
                    .metadata(json!({ "elapsed_ms": started.elapsed().as_millis() as u64 })),
            )
            .await;

        if assignment_gate(&side_result, is_collage, self.config.min_confidence_for_assignment) {
            self.catalog
                .assign_image_to_card(&CardAssignment {
                    card_id: job.card_id.clone(),
                    image_id,
                    role: ROLE_PRIMARY_FRONT.to_string(),
                    source_id,
                    source_url: Some(job.source_url.clone()),
                })
                .await
                .map_err(|e| StageFailure::from(e).with_image(image_id))?;
            self.catalog
                .log_ingest_event(
                    IngestEvent::new(EventType::Assigned)
                        .card(&job.card_id)
                        .image(image_id)
                        .message(ROLE_PRIMARY_FRONT),
                )
                .await;

            info!(card_id = %job.card_id, %image_id, side = %side_result.side, "image assigned");
            Ok(ProcessResult {
                status: ProcessStatus::Completed,
                image_id: Some(image_id),
                sha256: Some(sha256),
                detected_side: Some(side_result.side),
                confidence: Some(side_result.confidence),
                error: None,
            })
        } else {
            let reason = format!(
                "Not assigned: side={}, confidence={:.2}, isCollage={}",
                side_result.side, side_result.confidence, is_collage
            );
            self.catalog
                .log_ingest_event(
                    IngestEvent::new(EventType::Rejected)
                        .card(&job.card_id)
                        .image(image_id)
                        .message(&reason),
                )
                .await;

            info!(card_id = %job.card_id, %image_id, %reason, "image stored but not assigned");
            Ok(ProcessResult {
                status: ProcessStatus::Rejected,
                image_id: Some(image_id),
                sha256: Some(sha256),
                detected_side: Some(side_result.side),
                confidence: Some(side_result.confidence),
                error: Some(reason),
            })
        }
    }

    async fn resolve_source(&self, job: &ImageJob) -> Result<Option<ImageSource>, StageFailure> {
        if let Some(id) = &job.source_id {
            if let Some(source) = self.catalog.image_source(id).await? {
                return Ok(Some(source));
            }
        }
        if let Some(name) = &job.source_name {
            if let Some(source) = self.catalog.image_source_by_name(name).await? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    /// Dedup hit: the bytes already live in the catalog. Assign the stored
    /// image to this card and stop. By default the prior classification is
    /// trusted even when it was not a front; `require_front_on_dedup`
    /// gates the assignment on the stored side.
    async fn handle_dedup(
        &self,
        job: &ImageJob,
        image_id: Uuid,
        stored_side: Side,
        sha256: &str,
        source_id: Option<String>,
    ) -> Result<ProcessResult, StageFailure> {
        self.catalog
            .log_ingest_event(
                IngestEvent::new(EventType::Deduplicated)
                    .card(&job.card_id)
                    .image(image_id)
                    .metadata(json!({ "sha256": sha256 })),
            )
            .await;

        if !self.config.require_front_on_dedup || stored_side == Side::Front {
            self.catalog
                .assign_image_to_card(&CardAssignment {
                    card_id: job.card_id.clone(),
                    image_id,
                    role: ROLE_PRIMARY_FRONT.to_string(),
                    source_id,
                    source_url: Some(job.source_url.clone()),
                })
                .await?;
        }

        Ok(ProcessResult {
            status: ProcessStatus::Deduplicated,
            image_id: Some(image_id),
            sha256: Some(sha256.to_string()),
            detected_side: None,
            confidence: None,
            error: None,
        })
    }
}

/// Final assignment gate, factored out for direct property testing.
pub fn assignment_gate(side: &SideDetectionResult, is_collage: bool, min_confidence: f64) -> bool {
    side.side == Side::Front && side.confidence >= min_confidence && !is_collage
}
