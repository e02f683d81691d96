//! Vision-model side verification.
//!
//! Untrusted or ambiguous classifications can be escalated to an external
//! multimodal model. The checker degrades gracefully: no API key, transport
//! errors, and unparseable replies all come back as an unknown verdict
//! instead of failing the job.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

use crate::pipeline::ImageJob;
use crate::side_detector::{DetectionMethod, Side, SideDetectionResult};

/// When a tier-2 job's confidence lands in `[lower, upper)` the vision
/// check always runs; outside the band it is sampled.
#[derive(Debug, Clone, Copy)]
pub struct VisionPolicy {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub sample_rate: f64,
}

impl Default for VisionPolicy {
    fn default() -> Self {
        Self {
            lower_bound: 0.6,
            upper_bound: 0.9,
            sample_rate: 0.1,
        }
    }
}

/// Decide whether a job should be escalated to the vision model.
/// Tier 1 sources are trusted outright; tier 3 sources are always checked.
pub fn should_run_vision_check(trust_tier: u8, current_confidence: f64, policy: &VisionPolicy) -> bool {
    match trust_tier {
        1 => false,
        2 => {
            if current_confidence >= policy.lower_bound && current_confidence < policy.upper_bound {
                true
            } else {
                rand::thread_rng().gen::<f64>() < policy.sample_rate
            }
        }
        _ => true,
    }
}

/// OpenRouter chat-completions client for front/back verification.
#[derive(Debug, Clone)]
pub struct VisionChecker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl VisionChecker {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    /// Ask the model which side of a card the image shows. The reply is a
    /// single token; anything we cannot interpret maps to unknown.
    pub async fn check(
        &self,
        bytes: &[u8],
        content_type: &str,
        job: &ImageJob,
        trust_tier: u8,
    ) -> SideDetectionResult {
        let Some(api_key) = self.api_key.as_deref() else {
            return SideDetectionResult::unknown(DetectionMethod::Vision);
        };

        let mut prompt = String::from(
            "You are looking at a trading card image. Reply with exactly one word: \
             FRONT if the image shows the front of a single card, BACK if it shows \
             the card back, or UNKNOWN if you cannot tell.",
        );
        if trust_tier >= 2 {
            if let (Some(number), Some(set_code)) = (&job.card_number, &job.set_code) {
                prompt.push_str(&format!(
                    " The image should be card {} from set {}. If it clearly shows a \
                     different card, reply WRONG_CARD instead.",
                    number, set_code
                ));
            }
        }

        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", content_type, BASE64.encode(bytes))
                        }
                    }
                ]
            }],
            "max_tokens": 50,
            "temperature": 0
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "vision check failed");
                return SideDetectionResult::unknown(DetectionMethod::Vision);
            }
            Err(e) => {
                warn!(error = %e, "vision check transport error");
                return SideDetectionResult::unknown(DetectionMethod::Vision);
            }
        };

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "vision response was not JSON");
                return SideDetectionResult::unknown(DetectionMethod::Vision);
            }
        };

        let reply = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        verdict_from_reply(reply)
    }
}

/// Map the model's reply to a detection result. Containment is checked in
/// priority order, so "NOT FRONT" still reads as a front verdict, matching
/// the production behavior this worker replaces.
fn verdict_from_reply(reply: &str) -> SideDetectionResult {
    let upper = reply.to_uppercase();
    if upper.contains("FRONT") {
        SideDetectionResult {
            side: Side::Front,
            confidence: 0.95,
            method: DetectionMethod::Vision,
        }
    } else if upper.contains("BACK") {
        SideDetectionResult {
            side: Side::Back,
            confidence: 0.95,
            method: DetectionMethod::Vision,
        }
    } else if upper.contains("WRONG_CARD") {
        SideDetectionResult {
            side: Side::Unknown,
            confidence: 0.3,
            method: DetectionMethod::Vision,
        }
    } else {
        SideDetectionResult::unknown(DetectionMethod::Vision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> ImageJob {
        ImageJob {
            card_id: "c1".to_string(),
            source_url: "http://example.test/a.jpg".to_string(),
            source_id: None,
            source_name: None,
            trust_tier: None,
            card_number: Some("025/165".to_string()),
            set_code: Some("MEW".to_string()),
            priority: None,
        }
    }

    #[test]
    fn tier_one_never_checks() {
        let policy = VisionPolicy {
            sample_rate: 1.0,
            ..VisionPolicy::default()
        };
        assert!(!should_run_vision_check(1, 0.0, &policy));
        assert!(!should_run_vision_check(1, 0.75, &policy));
    }

    #[test]
    fn tier_three_always_checks() {
        let policy = VisionPolicy {
            sample_rate: 0.0,
            ..VisionPolicy::default()
        };
        assert!(should_run_vision_check(3, 0.99, &policy));
        assert!(should_run_vision_check(3, 0.0, &policy));
    }

    #[test]
    fn tier_two_checks_inside_the_ambiguity_band() {
        let policy = VisionPolicy {
            sample_rate: 0.0,
            ..VisionPolicy::default()
        };
        assert!(should_run_vision_check(2, 0.6, &policy));
        assert!(should_run_vision_check(2, 0.75, &policy));
        assert!(should_run_vision_check(2, 0.89, &policy));
        // Band is half-open: 0.9 falls back to sampling.
        assert!(!should_run_vision_check(2, 0.9, &policy));
        assert!(!should_run_vision_check(2, 0.95, &policy));
        assert!(!should_run_vision_check(2, 0.3, &policy));
    }

    #[test]
    fn tier_two_out_of_band_follows_sample_rate() {
        let always = VisionPolicy {
            sample_rate: 1.0,
            ..VisionPolicy::default()
        };
        assert!(should_run_vision_check(2, 0.95, &always));
    }

    #[test]
    fn reply_parsing_priority() {
        assert_eq!(verdict_from_reply("FRONT").side, Side::Front);
        assert_eq!(verdict_from_reply("front, definitely").side, Side::Front);
        assert_eq!(verdict_from_reply("BACK").side, Side::Back);
        assert_eq!(verdict_from_reply("WRONG_CARD").confidence, 0.3);
        assert_eq!(verdict_from_reply("no idea").side, Side::Unknown);
        assert_eq!(verdict_from_reply("no idea").confidence, 0.5);
        assert_eq!(verdict_from_reply("").method, DetectionMethod::Vision);
    }

    #[tokio::test]
    async fn missing_api_key_skips_the_call() {
        let checker = VisionChecker::new(
            "http://127.0.0.1:1".to_string(),
            None,
            "google/gemini-2.5-flash-preview".to_string(),
        );
        let result = checker.check(b"bytes", "image/jpeg", &job(), 3).await;
        assert_eq!(result.side, Side::Unknown);
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.method, DetectionMethod::Vision);
    }

    #[tokio::test]
    async fn successful_reply_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "FRONT" } }]
            })))
            .mount(&server)
            .await;

        let checker = VisionChecker::new(
            server.uri(),
            Some("test-key".to_string()),
            "google/gemini-2.5-flash-preview".to_string(),
        );
        let result = checker.check(b"bytes", "image/png", &job(), 3).await;
        assert_eq!(result.side, Side::Front);
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.method, DetectionMethod::Vision);
    }

    #[tokio::test]
    async fn server_error_degrades_to_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = VisionChecker::new(
            server.uri(),
            Some("test-key".to_string()),
            "google/gemini-2.5-flash-preview".to_string(),
        );
        let result = checker.check(b"bytes", "image/jpeg", &job(), 3).await;
        assert_eq!(result.side, Side::Unknown);
        assert_eq!(result.confidence, 0.5);
    }
}
