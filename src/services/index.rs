//! HTTP client for the per-gallery face embedding index.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{FaceIndex, FaceMatch, IndexedFace};
use crate::config::ServicesConfig;
use crate::error::{classify_http_error, AnalysisError};

pub struct HttpFaceIndex {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CreateCollectionRequest<'a> {
    collection_id: &'a str,
}

#[derive(Debug, Serialize)]
struct IndexFaceRequest<'a> {
    image: String,
    external_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct IndexFaceResponse {
    /// Null when the service could not find a usable face in the crop.
    face: Option<IndexedFace>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    face_id: &'a str,
    similarity_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    matches: Vec<FaceMatch>,
}

impl HttpFaceIndex {
    pub fn new(config: &ServicesConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.index_endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    async fn post<T: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, AnalysisError> {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.client.post(&url).timeout(self.timeout).json(body);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| classify_http_error(&e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AnalysisError::RateLimit(format!(
                "face index returned 429 for {}",
                path
            )));
        }
        if !status.is_success() {
            return Err(AnalysisError::Api(format!(
                "face index returned {} for {}",
                status, path
            )));
        }

        response.json().await.map_err(|e| classify_http_error(&e))
    }
}

#[async_trait]
impl FaceIndex for HttpFaceIndex {
    async fn create_collection(&self, collection_id: &str) -> Result<(), AnalysisError> {
        let _: serde_json::Value = self
            .post("/collections", &CreateCollectionRequest { collection_id })
            .await?;
        Ok(())
    }

    async fn index_face(
        &self,
        collection_id: &str,
        crop: &[u8],
        external_id: &str,
    ) -> Result<Option<IndexedFace>, AnalysisError> {
        let response: IndexFaceResponse = self
            .post(
                &format!("/collections/{}/faces", collection_id),
                &IndexFaceRequest {
                    image: BASE64.encode(crop),
                    external_id,
                },
            )
            .await?;
        Ok(response.face)
    }

    async fn search_faces_by_id(
        &self,
        collection_id: &str,
        face_id: &str,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>, AnalysisError> {
        let response: SearchResponse = self
            .post(
                &format!("/collections/{}/search", collection_id),
                &SearchRequest {
                    face_id,
                    similarity_threshold: threshold,
                },
            )
            .await?;
        Ok(response.matches)
    }
}
