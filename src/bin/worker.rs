//! Worker entrypoint: HTTP surface + process bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tracing::info;

use bourdain_image_worker::catalog::{Catalog, PgCatalog};
use bourdain_image_worker::config::WorkerConfig;
use bourdain_image_worker::storage::{BlobStore, SupabaseStorage};
use bourdain_image_worker::{ImageJob, IngestPipeline, ProcessStatus, WorkerResult};

#[tokio::main]
async fn main() -> WorkerResult<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = WorkerConfig::from_env()?;

    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::connect(&config.database_url).await?);
    let blobs: Arc<dyn BlobStore> = Arc::new(SupabaseStorage::new(
        config.storage_url.clone(),
        config.storage_bucket.clone(),
        config.storage_key.clone(),
    ));

    let pipeline = Arc::new(IngestPipeline::new(config.clone(), catalog, blobs));
    let _sweeper = pipeline
        .rate_limiter()
        .spawn_sweeper(config.bucket_gc_interval);

    let app = Router::new()
        .route("/jobs", post(submit_job))
        .route("/health", get(health))
        .with_state(pipeline);

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("🚀 image worker listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Accept one ingest job. Rate-limit deferrals map to 429 so the caller
/// retries; every other outcome is a 200 with the structured result.
async fn submit_job(
    State(pipeline): State<Arc<IngestPipeline>>,
    Json(job): Json<ImageJob>,
) -> Response {
    if job.card_id.trim().is_empty() || job.source_url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "cardId and sourceUrl are required" })),
        )
            .into_response();
    }

    let result = pipeline.process_image(job).await;
    let status = if result.status == ProcessStatus::RateLimited {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::OK
    };
    (status, Json(result)).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "image-worker",
        "timestamp": chrono::Utc::now(),
    }))
}
