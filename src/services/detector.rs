//! HTTP client for the CV face-detection service.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{DetectedFace, FaceDetector};
use crate::config::ServicesConfig;
use crate::error::{classify_http_error, AnalysisError};

pub struct HttpFaceDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct DetectRequest {
    image: String,
    min_confidence: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    faces: Vec<DetectedFace>,
}

impl HttpFaceDetector {
    pub fn new(config: &ServicesConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.detector_endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(
        &self,
        image: &[u8],
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, AnalysisError> {
        let request = DetectRequest {
            image: BASE64.encode(image),
            min_confidence,
        };

        let url = format!("{}/detect", self.endpoint);
        let mut req = self.client.post(&url).timeout(self.timeout).json(&request);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| classify_http_error(&e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AnalysisError::RateLimit(
                "detector returned 429".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(AnalysisError::Api(format!(
                "detector returned {}",
                status
            )));
        }

        let detected: DetectResponse =
            response.json().await.map_err(|e| classify_http_error(&e))?;

        // The service applies min_confidence server-side; filter again in
        // case an older deployment ignores the parameter.
        Ok(detected
            .faces
            .into_iter()
            .filter(|f| f.confidence >= min_confidence)
            .collect())
    }
}
