//! Ingest event taxonomy.
//!
//! Every stage boundary of the pipeline appends one event to the catalog's
//! `image_ingest_events` log. The log is a side channel: writes are
//! fire-and-forget and never affect the job outcome.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FetchStarted,
    FetchCompleted,
    FetchFailed,
    Deduplicated,
    ValidationFailed,
    ValidationPassed,
    ProcessingStarted,
    DerivativesGenerated,
    UploadCompleted,
    ProcessingCompleted,
    Rejected,
    Assigned,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FetchStarted => "fetch_started",
            EventType::FetchCompleted => "fetch_completed",
            EventType::FetchFailed => "fetch_failed",
            EventType::Deduplicated => "deduplicated",
            EventType::ValidationFailed => "validation_failed",
            EventType::ValidationPassed => "validation_passed",
            EventType::ProcessingStarted => "processing_started",
            EventType::DerivativesGenerated => "derivatives_generated",
            EventType::UploadCompleted => "upload_completed",
            EventType::ProcessingCompleted => "processing_completed",
            EventType::Rejected => "rejected",
            EventType::Assigned => "assigned",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only log row.
#[derive(Debug, Clone, Serialize)]
pub struct IngestEvent {
    pub card_id: Option<String>,
    pub candidate_id: Option<String>,
    pub image_id: Option<Uuid>,
    pub event_type: EventType,
    pub message: Option<String>,
    pub http_status: Option<u16>,
    pub metadata: Option<serde_json::Value>,
}

impl IngestEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            card_id: None,
            candidate_id: None,
            image_id: None,
            event_type,
            message: None,
            http_status: None,
            metadata: None,
        }
    }

    pub fn card(mut self, card_id: &str) -> Self {
        self.card_id = Some(card_id.to_string());
        self
    }

    pub fn image(mut self, image_id: Uuid) -> Self {
        self.image_id = Some(image_id);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_serialize_snake_case() {
        assert_eq!(EventType::FetchStarted.as_str(), "fetch_started");
        assert_eq!(
            serde_json::to_string(&EventType::DerivativesGenerated).unwrap(),
            "\"derivatives_generated\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::Rejected).unwrap(),
            "\"rejected\""
        );
    }

    #[test]
    fn builder_fills_optional_fields() {
        let event = IngestEvent::new(EventType::FetchFailed)
            .card("c1")
            .message("HTTP 404")
            .http_status(Some(404));

        assert_eq!(event.card_id.as_deref(), Some("c1"));
        assert_eq!(event.message.as_deref(), Some("HTTP 404"));
        assert_eq!(event.http_status, Some(404));
        assert!(event.image_id.is_none());
        assert!(event.metadata.is_none());
    }
}
