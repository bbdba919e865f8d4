//! OpenAI-compatible vision-language client.
//!
//! Works with LM Studio, OpenAI, and compatible endpoints. Images are
//! resized and re-encoded as JPEG before upload so the request stays small
//! regardless of what the gallery stores.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

use super::VisionAnnotator;
use crate::config::AnnotatorConfig;
use crate::error::{classify_http_error, AnalysisError};

const MAX_UPLOAD_DIMENSION: u32 = 1024;

pub struct HttpVisionAnnotator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl HttpVisionAnnotator {
    pub fn new(config: &AnnotatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    async fn chat(
        &self,
        content: Vec<ContentPart>,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, AnalysisError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens,
            temperature,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self.client.post(&url).timeout(timeout).json(&request);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| classify_http_error(&e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::RateLimit(format!(
                "annotator returned 429: {}",
                truncate(&body, 200)
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let text = body.to_lowercase();
            if text.contains("quota") || text.contains("rate limit") {
                return Err(AnalysisError::RateLimit(format!(
                    "annotator returned {}: {}",
                    status,
                    truncate(&body, 200)
                )));
            }
            return Err(AnalysisError::Api(format!(
                "annotator returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| classify_http_error(&e))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AnalysisError::Api("annotator returned no choices".to_string()))
    }
}

#[async_trait]
impl VisionAnnotator for HttpVisionAnnotator {
    async fn generate(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, AnalysisError> {
        let data_url = encode_data_url(image, mime_type)?;
        self.chat(
            vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ],
            1500,
            0.3,
            timeout,
        )
        .await
    }

    async fn rank(&self, prompt: &str, timeout: Duration) -> Result<String, AnalysisError> {
        self.chat(
            vec![ContentPart::Text {
                text: prompt.to_string(),
            }],
            1000,
            0.2,
            timeout,
        )
        .await
    }
}

/// Decode, downscale to at most 1024px, re-encode as JPEG, and wrap in a
/// base64 data URL. Falls back to shipping the original bytes when they
/// cannot be decoded (the model may still accept them).
fn encode_data_url(image_bytes: &[u8], mime_type: &str) -> Result<String, AnalysisError> {
    match image::load_from_memory(image_bytes) {
        Ok(img) => {
            let (width, height) = img.dimensions();
            let img = if width > MAX_UPLOAD_DIMENSION || height > MAX_UPLOAD_DIMENSION {
                img.resize(
                    MAX_UPLOAD_DIMENSION,
                    MAX_UPLOAD_DIMENSION,
                    image::imageops::FilterType::Triangle,
                )
            } else {
                img
            };

            let mut buf = Cursor::new(Vec::new());
            let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
            img.write_with_encoder(encoder)
                .map_err(|e| AnalysisError::Image(format!("failed to re-encode image: {}", e)))?;

            Ok(format!(
                "data:image/jpeg;base64,{}",
                BASE64.encode(buf.into_inner())
            ))
        }
        Err(_) => Ok(format!(
            "data:{};base64,{}",
            mime_type,
            BASE64.encode(image_bytes)
        )),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
