//! Person detector client
//!
//! The detection model runs out of process. [`HttpPersonDetector`] posts
//! the encoded frame to `{url}/detect?conf=<threshold>` and expects:
//!
//! ```json
//! {"persons": [{"bbox": [x1, y1, x2, y2], "confidence": 0.87}]}
//! ```
//!
//! Boxes are in frame pixels. Each box is reduced to its center. A body
//! carrying `error`, or lacking `persons`, is a failed detection even when
//! the status is 2xx.

use crate::domain::types::PersonObservation;
use crate::io::frame_source::Frame;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Opaque person-detection capability
#[async_trait]
pub trait PersonDetector: Send + Sync {
    /// Persons in `frame` with confidence at or above `confidence`
    async fn detect(&self, frame: &Frame, confidence: f32) -> anyhow::Result<Vec<PersonObservation>>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    persons: Option<Vec<DetectedPerson>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetectedPerson {
    bbox: [f64; 4],
    confidence: f32,
}

fn parse_response(body: &[u8], confidence: f32) -> anyhow::Result<Vec<PersonObservation>> {
    let response: DetectResponse =
        serde_json::from_slice(body).context("detector response is not valid JSON")?;
    if let Some(error) = response.error {
        bail!("detector rejected the frame: {error}");
    }
    let Some(persons) = response.persons else {
        bail!("detector response has no persons field");
    };
    Ok(persons
        .into_iter()
        .filter(|p| p.confidence >= confidence)
        .map(|p| PersonObservation::from_bbox(p.bbox, p.confidence))
        .collect())
}

/// HTTP client for the detection service
pub struct HttpPersonDetector {
    client: reqwest::Client,
    detect_url: String,
}

impl HttpPersonDetector {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build detector HTTP client")?;
        Ok(Self { client, detect_url: format!("{}/detect", base_url.trim_end_matches('/')) })
    }
}

#[async_trait]
impl PersonDetector for HttpPersonDetector {
    async fn detect(&self, frame: &Frame, confidence: f32) -> anyhow::Result<Vec<PersonObservation>> {
        let url = format!("{}?conf={}", self.detect_url, confidence);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, frame.content_type())
            .body(frame.data().clone())
            .send()
            .await
            .with_context(|| format!("detector request to {} failed", self.detect_url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("detector returned HTTP {status}");
        }

        let body = resp.bytes().await.context("detector response read failed")?;
        let persons = parse_response(&body, confidence)?;
        debug!(persons = persons.len(), "detector_response");
        Ok(persons)
    }
}
