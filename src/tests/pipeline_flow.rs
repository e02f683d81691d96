//! Full pipeline scenarios: real HTTP via wiremock, in-memory catalog and
//! blob store fakes, synthetic card images.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::catalog::{
    CardAssignment, Catalog, CatalogError, ImageSource, ImageStatus, NewImage, StoredImage,
};
use crate::config::WorkerConfig;
use crate::derivatives::Variant;
use crate::events::{EventType, IngestEvent};
use crate::hashing;
use crate::pipeline::{ImageJob, IngestPipeline, ProcessStatus};
use crate::side_detector::Side;
use crate::storage::{BlobStore, StorageError};

#[derive(Debug, Clone)]
struct DerivativeRow {
    image_id: Uuid,
    variant: Variant,
    width: u32,
    storage_path: String,
}

#[derive(Default)]
struct MemoryCatalog {
    sources: Vec<ImageSource>,
    images: Mutex<HashMap<String, StoredImage>>,
    statuses: Mutex<HashMap<Uuid, (ImageStatus, Option<String>)>>,
    derivative_rows: Mutex<Vec<DerivativeRow>>,
    assignments: Mutex<HashMap<(String, String), Uuid>>,
    events: Mutex<Vec<IngestEvent>>,
}

impl MemoryCatalog {
    fn with_sources(sources: Vec<ImageSource>) -> Self {
        Self {
            sources,
            ..Self::default()
        }
    }

    fn event_types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    fn status_of(&self, image_id: Uuid) -> Option<ImageStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&image_id)
            .map(|(status, _)| *status)
    }

    fn assignment(&self, card_id: &str, role: &str) -> Option<Uuid> {
        self.assignments
            .lock()
            .unwrap()
            .get(&(card_id.to_string(), role.to_string()))
            .copied()
    }

    fn derivative_widths(&self) -> Vec<u32> {
        self.derivative_rows
            .lock()
            .unwrap()
            .iter()
            .map(|row| row.width)
            .collect()
    }

    fn derivative_rows_for(&self, image_id: Uuid) -> Vec<(Variant, String)> {
        self.derivative_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.image_id == image_id)
            .map(|row| (row.variant, row.storage_path.clone()))
            .collect()
    }

    fn validation_passed_metadata(&self) -> Option<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.event_type == EventType::ValidationPassed)
            .and_then(|e| e.metadata.clone())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_image_by_sha256(&self, sha256: &str) -> Result<Option<StoredImage>, CatalogError> {
        Ok(self.images.lock().unwrap().get(sha256).cloned())
    }

    async fn image_source(&self, id: &str) -> Result<Option<ImageSource>, CatalogError> {
        Ok(self.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn image_source_by_name(&self, name: &str) -> Result<Option<ImageSource>, CatalogError> {
        Ok(self.sources.iter().find(|s| s.name == name).cloned())
    }

    async fn create_image_record(&self, image: &NewImage) -> Result<Uuid, CatalogError> {
        let mut images = self.images.lock().unwrap();
        if images.contains_key(&image.sha256) {
            return Err(CatalogError::DuplicateImage);
        }
        let id = Uuid::new_v4();
        images.insert(
            image.sha256.clone(),
            StoredImage {
                id,
                detected_side: image.detected_side,
            },
        );
        self.statuses
            .lock()
            .unwrap()
            .insert(id, (ImageStatus::Processing, None));
        Ok(id)
    }

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
        error: Option<&str>,
    ) -> Result<(), CatalogError> {
        self.statuses
            .lock()
            .unwrap()
            .insert(image_id, (status, error.map(String::from)));
        Ok(())
    }

    async fn create_derivative_record(
        &self,
        image_id: Uuid,
        variant: Variant,
        _format: &str,
        width: u32,
        _height: u32,
        _bytes: usize,
        storage_path: &str,
    ) -> Result<(), CatalogError> {
        self.derivative_rows.lock().unwrap().push(DerivativeRow {
            image_id,
            variant,
            width,
            storage_path: storage_path.to_string(),
        });
        Ok(())
    }

    async fn assign_image_to_card(&self, assignment: &CardAssignment) -> Result<(), CatalogError> {
        self.assignments.lock().unwrap().insert(
            (assignment.card_id.clone(), assignment.role.clone()),
            assignment.image_id,
        );
        Ok(())
    }

    async fn log_ingest_event(&self, event: IngestEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("http://blob.test/{path}")
    }
}

fn source(id: &str, name: &str, trust_tier: i16, max_rps: i32) -> ImageSource {
    ImageSource {
        id: id.to_string(),
        name: name.to_string(),
        base_url: "http://source.test".to_string(),
        trust_tier,
        max_rps,
        max_concurrency: 4,
        is_allowed: true,
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        // Keep tier-2 sampling deterministic in tests.
        vision_sample_rate: 0.0,
        ..WorkerConfig::default()
    }
}

fn build_pipeline(
    config: WorkerConfig,
    sources: Vec<ImageSource>,
) -> (IngestPipeline, Arc<MemoryCatalog>, Arc<MemoryBlobStore>) {
    let catalog = Arc::new(MemoryCatalog::with_sources(sources));
    let blobs = Arc::new(MemoryBlobStore::default());
    let pipeline = IngestPipeline::new(
        config,
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        Arc::clone(&blobs) as Arc<dyn BlobStore>,
    );
    (pipeline, catalog, blobs)
}

fn job(card_id: &str, url: &str) -> ImageJob {
    ImageJob {
        card_id: card_id.to_string(),
        source_url: url.to_string(),
        source_id: None,
        source_name: None,
        trust_tier: None,
        card_number: None,
        set_code: None,
        priority: None,
    }
}

/// A card-shaped JPEG: saturated yellow border, flat green face.
fn card_front_jpeg(width: u32, height: u32) -> Vec<u8> {
    let margin_x = width / 10;
    let margin_y = height / 10;
    let img = RgbImage::from_fn(width, height, |x, y| {
        if x < margin_x || x >= width - margin_x || y < margin_y || y >= height - margin_y {
            Rgb([240, 210, 30])
        } else {
            Rgb([90, 140, 60])
        }
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

fn flat_gray_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

async fn serve_image(server: &MockServer, route: &str, body: Vec<u8>, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type))
        .mount(server)
        .await;
}

#[tokio::test]
async fn happy_path_stores_uploads_and_assigns() {
    let server = MockServer::start().await;
    let body = card_front_jpeg(734, 1024);
    let expected_sha = hashing::sha256_hex(&body);
    serve_image(&server, "/a.jpg", body, "image/jpeg").await;

    let (pipeline, catalog, blobs) =
        build_pipeline(test_config(), vec![source("s1", "cardsource", 1, 100)]);

    let mut job = job("c1", &format!("{}/a.jpg", server.uri()));
    job.source_id = Some("s1".to_string());
    let result = pipeline.process_image(job).await;

    assert_eq!(result.status, ProcessStatus::Completed);
    assert_eq!(result.sha256.as_deref(), Some(expected_sha.as_str()));
    assert_eq!(result.detected_side, Some(Side::Front));
    assert!(result.confidence.unwrap() >= 0.8);
    assert!(result.error.is_none());

    let image_id = result.image_id.unwrap();
    assert_eq!(catalog.status_of(image_id), Some(ImageStatus::Completed));
    assert_eq!(catalog.assignment("c1", "primary_front"), Some(image_id));

    // Three variants, detail capped by the 734px original.
    assert_eq!(catalog.derivative_widths(), vec![160, 360, 734]);
    let prefix = &expected_sha[..2];
    assert_eq!(
        catalog.derivative_rows_for(image_id),
        vec![
            (
                Variant::Thumb,
                format!("derivatives/{prefix}/{expected_sha}/thumb.webp")
            ),
            (
                Variant::Grid,
                format!("derivatives/{prefix}/{expected_sha}/grid.webp")
            ),
            (
                Variant::Detail,
                format!("derivatives/{prefix}/{expected_sha}/detail.webp")
            ),
        ]
    );
    assert_eq!(
        blobs.paths(),
        vec![
            format!("derivatives/{prefix}/{expected_sha}/detail.webp"),
            format!("derivatives/{prefix}/{expected_sha}/grid.webp"),
            format!("derivatives/{prefix}/{expected_sha}/thumb.webp"),
        ]
    );

    assert_eq!(
        catalog.event_types(),
        vec![
            EventType::FetchStarted,
            EventType::FetchCompleted,
            EventType::ValidationPassed,
            EventType::ProcessingStarted,
            EventType::DerivativesGenerated,
            EventType::UploadCompleted,
            EventType::ProcessingCompleted,
            EventType::Assigned,
        ]
    );
}

#[tokio::test]
async fn replaying_identical_bytes_deduplicates() {
    let server = MockServer::start().await;
    serve_image(&server, "/a.jpg", card_front_jpeg(734, 1024), "image/jpeg").await;

    let (pipeline, catalog, _blobs) =
        build_pipeline(test_config(), vec![source("s1", "cardsource", 1, 100)]);

    let mut first = job("c1", &format!("{}/a.jpg", server.uri()));
    first.source_id = Some("s1".to_string());
    let second = first.clone();

    let first_result = pipeline.process_image(first).await;
    assert_eq!(first_result.status, ProcessStatus::Completed);
    let image_id = first_result.image_id.unwrap();

    let second_result = pipeline.process_image(second).await;
    assert_eq!(second_result.status, ProcessStatus::Deduplicated);
    assert_eq!(second_result.image_id, Some(image_id));
    assert_eq!(second_result.sha256, first_result.sha256);

    // One row ever, and the card still points at it.
    assert_eq!(catalog.image_count(), 1);
    assert_eq!(catalog.assignment("c1", "primary_front"), Some(image_id));
    assert!(catalog.event_types().contains(&EventType::Deduplicated));
}

#[tokio::test]
async fn second_job_within_the_window_is_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (pipeline, catalog, _blobs) =
        build_pipeline(test_config(), vec![source("s1", "cardsource", 1, 1)]);

    // First job drains the single token (the fetch 404s, but the token is
    // spent at the rate check).
    let mut first = job("c1", &format!("{}/missing.jpg", server.uri()));
    first.source_id = Some("s1".to_string());
    let first_result = pipeline.process_image(first).await;
    assert_eq!(first_result.status, ProcessStatus::Failed);
    let events_after_first = catalog.event_count();

    let mut second = job("c2", &format!("{}/missing.jpg", server.uri()));
    second.source_id = Some("s1".to_string());
    let second_result = pipeline.process_image(second).await;

    assert_eq!(second_result.status, ProcessStatus::RateLimited);
    assert_eq!(
        second_result.error.as_deref(),
        Some("Rate limited, retry after 1000ms")
    );
    // Only the fetch_started emitted before the rate check; nothing after.
    assert_eq!(catalog.event_count(), events_after_first + 1);
    assert_eq!(*catalog.event_types().last().unwrap(), EventType::FetchStarted);
}

#[tokio::test]
async fn known_error_payload_fails_without_an_image_row() {
    let server = MockServer::start().await;
    serve_image(&server, "/ghost.png", vec![0u8; 186_316], "image/png").await;

    let (pipeline, catalog, blobs) = build_pipeline(
        test_config(),
        vec![source("s9", "pokemontcg_api", 1, 100)],
    );

    let mut job = job("c1", &format!("{}/ghost.png", server.uri()));
    job.source_name = Some("pokemontcg_api".to_string());
    let result = pipeline.process_image(job).await;

    assert_eq!(result.status, ProcessStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("known_error_payload"));
    assert!(catalog.event_types().contains(&EventType::FetchFailed));
    assert_eq!(catalog.image_count(), 0);
    assert!(blobs.paths().is_empty());
}

#[tokio::test]
async fn collage_is_persisted_but_rejected() {
    let server = MockServer::start().await;
    serve_image(&server, "/sheet.jpg", card_front_jpeg(1600, 600), "image/jpeg").await;

    let (pipeline, catalog, blobs) =
        build_pipeline(test_config(), vec![source("s1", "cardsource", 1, 100)]);

    let mut job = job("c1", &format!("{}/sheet.jpg", server.uri()));
    job.source_id = Some("s1".to_string());
    let result = pipeline.process_image(job).await;

    assert_eq!(result.status, ProcessStatus::Rejected);
    let error = result.error.unwrap();
    assert!(error.starts_with("Not assigned:"), "unexpected error: {error}");
    assert!(error.contains("isCollage=true"));

    // Derivatives were still generated and uploaded; only the assignment
    // was withheld.
    let image_id = result.image_id.unwrap();
    assert_eq!(catalog.status_of(image_id), Some(ImageStatus::Completed));
    assert_eq!(catalog.derivative_widths(), vec![160, 360, 960]);
    assert_eq!(blobs.paths().len(), 3);
    assert!(catalog.assignment("c1", "primary_front").is_none());
    assert!(catalog.event_types().contains(&EventType::Rejected));
}

#[tokio::test]
async fn vision_verdict_overrides_uncertain_heuristic() {
    let image_server = MockServer::start().await;
    serve_image(&image_server, "/gray.jpg", flat_gray_jpeg(734, 1024), "image/jpeg").await;

    let vision_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "FRONT" } }]
        })))
        .expect(1)
        .mount(&vision_server)
        .await;

    let config = WorkerConfig {
        openrouter_api_key: Some("test-key".to_string()),
        vision_base_url: vision_server.uri(),
        ..test_config()
    };
    let (pipeline, catalog, _blobs) =
        build_pipeline(config, vec![source("s3", "untrusted_source", 3, 100)]);

    let mut job = job("c1", &format!("{}/gray.jpg", image_server.uri()));
    job.source_id = Some("s3".to_string());
    let result = pipeline.process_image(job).await;

    assert_eq!(result.status, ProcessStatus::Completed);
    assert_eq!(result.detected_side, Some(Side::Front));
    assert_eq!(result.confidence, Some(0.95));
    assert!(catalog.assignment("c1", "primary_front").is_some());

    let metadata = catalog.validation_passed_metadata().unwrap();
    assert_eq!(metadata["method"], "vision");
    assert_eq!(metadata["side"], "front");
}

#[tokio::test]
async fn unresolvable_source_defaults_to_tier_three_and_no_limit() {
    let server = MockServer::start().await;
    serve_image(&server, "/a.jpg", card_front_jpeg(300, 419), "image/jpeg").await;

    // No sources configured and no vision key: tier 3 vision checks are
    // attempted but degrade to unknown, leaving the heuristic result.
    let (pipeline, catalog, _blobs) = build_pipeline(test_config(), vec![]);

    for n in 0..3 {
        let result = pipeline
            .process_image(job(&format!("c{n}"), &format!("{}/a.jpg", server.uri())))
            .await;
        // Never rate limited without a resolved source.
        assert_ne!(result.status, ProcessStatus::RateLimited);
    }
    assert_eq!(catalog.image_count(), 1);
}

#[tokio::test]
async fn oversized_pixel_count_is_a_validation_failure() {
    let server = MockServer::start().await;
    serve_image(&server, "/big.jpg", card_front_jpeg(734, 1024), "image/jpeg").await;

    let config = WorkerConfig {
        max_image_pixels: 10_000,
        ..test_config()
    };
    let (pipeline, catalog, _blobs) =
        build_pipeline(config, vec![source("s1", "cardsource", 1, 100)]);

    let mut job = job("c1", &format!("{}/big.jpg", server.uri()));
    job.source_id = Some("s1".to_string());
    let result = pipeline.process_image(job).await;

    assert_eq!(result.status, ProcessStatus::Failed);
    assert!(result.error.unwrap().contains("pixel budget"));
    assert!(catalog.event_types().contains(&EventType::ValidationFailed));
    assert_eq!(catalog.image_count(), 0);
}
