//! Blob store uploads.
//!
//! Derivatives are uploaded to Supabase storage over its REST surface.
//! Uploads are idempotent (`x-upsert`) and carry an immutable cache
//! policy; the objects are content-addressed so a re-upload of the same
//! path is always the same bytes.

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upload transport error: {0}")]
    Transport(String),
}

/// Narrow seam over the object store so tests can swap in a fake.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Public URL for a stored object.
    fn public_url(&self, path: &str) -> String;
}

/// Supabase storage client.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    bucket: String,
    service_key: String,
}

impl SupabaseStorage {
    pub fn new(base_url: String, bucket: String, service_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket,
            service_key,
        }
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn put_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.service_key)
            .header(CONTENT_TYPE, content_type)
            .header(CACHE_CONTROL, IMMUTABLE_CACHE)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(path, "uploaded object");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}
