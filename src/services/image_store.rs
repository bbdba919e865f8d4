//! HTTP client for the keyed image blob store.

use async_trait::async_trait;
use std::time::Duration;

use super::ImageStore;
use crate::config::ServicesConfig;
use crate::error::{classify_http_error, AnalysisError};

pub struct HttpImageStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpImageStore {
    pub fn new(config: &ServicesConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.image_store_endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl ImageStore for HttpImageStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, AnalysisError> {
        let mut req = self.client.get(self.url_for(key)).timeout(self.timeout);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        // Any failure to produce image bytes, transport-level included, is
        // an image error: the photo cannot be analyzed without them.
        let response = req
            .send()
            .await
            .map_err(|e| AnalysisError::Image(format!("image fetch for {} failed: {}", key, e)))?;
        if !response.status().is_success() {
            return Err(AnalysisError::Image(format!(
                "image store returned {} for key {}",
                response.status(),
                key
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalysisError::Image(format!("image fetch for {} failed: {}", key, e)))?;
        Ok(bytes.to_vec())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), AnalysisError> {
        let mut req = self
            .client
            .put(self.url_for(key))
            .timeout(self.timeout)
            .header("Content-Type", content_type)
            .body(bytes);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| classify_http_error(&e))?;
        if !response.status().is_success() {
            return Err(AnalysisError::Api(format!(
                "image store returned {} writing key {}",
                response.status(),
                key
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_transport_failure_is_image_error() {
        // Port 9 (discard) is not listening; the connection is refused.
        let mut config = ServicesConfig::default();
        config.image_store_endpoint = "http://127.0.0.1:9".to_string();
        config.timeout_ms = 2000;

        let store = HttpImageStore::new(&config);
        let err = store.get("photos/p1.jpg").await.unwrap_err();
        assert_eq!(err.code(), "IMAGE_ERROR");
    }
}
