//! Interfaces to the external collaborators of the pipeline.
//!
//! Every component takes these as trait objects so tests can substitute
//! scripted fakes; the submodules provide the HTTP-backed production
//! implementations.

mod annotator;
mod detector;
mod image_store;
mod index;

pub use annotator::HttpVisionAnnotator;
pub use detector::HttpFaceDetector;
pub use image_store::HttpImageStore;
pub use index::HttpFaceIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AnalysisError;
use crate::model::BoundingBox;

/// Keyed blob storage holding the gallery's image bytes.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, AnalysisError>;
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<(), AnalysisError>;
}

/// Age estimate from the CV detector, in years.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgeRange {
    pub low: u32,
    pub high: u32,
}

/// One scored emotion label from the CV detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionScore {
    pub name: String,
    pub confidence: f32,
}

/// One face as the CV detector reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    /// Detector confidence, 0-100.
    pub confidence: f32,
    #[serde(default)]
    pub age_range: Option<AgeRange>,
    #[serde(default)]
    pub emotions: Vec<EmotionScore>,
}

impl DetectedFace {
    /// Highest-confidence emotion label, lower-cased.
    pub fn top_emotion(&self) -> Option<String> {
        self.emotions
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|e| e.name.to_lowercase())
    }
}

/// Dedicated computer-vision face detector; authoritative for geometry.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(
        &self,
        image: &[u8],
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, AnalysisError>;
}

/// Vision-language model used for annotation and search re-ranking.
///
/// Implementations must classify transport failures: HTTP 429 or quota
/// text as `RateLimit`, deadline overruns as `Timeout`, the rest as `Api`.
/// The orchestrator's retry filter depends on that classification.
#[async_trait]
pub trait VisionAnnotator: Send + Sync {
    /// Free-text (expected JSON) response to a prompt over an image.
    async fn generate(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, AnalysisError>;

    /// Text-only completion, used by the search re-ranker.
    async fn rank(&self, prompt: &str, timeout: Duration) -> Result<String, AnalysisError>;
}

/// Result of indexing one face crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFace {
    pub face_id: String,
    pub confidence: f32,
}

/// One similarity-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceMatch {
    pub face_id: String,
    pub similarity: f32,
}

/// Per-gallery face embedding index.
#[async_trait]
pub trait FaceIndex: Send + Sync {
    /// Create the collection if it does not already exist.
    async fn create_collection(&self, collection_id: &str) -> Result<(), AnalysisError>;

    /// Index a cropped face image. Returns None when the service finds no
    /// usable face in the crop.
    async fn index_face(
        &self,
        collection_id: &str,
        crop: &[u8],
        external_id: &str,
    ) -> Result<Option<IndexedFace>, AnalysisError>;

    /// Find other indexed faces similar to `face_id`, above `threshold`
    /// (0-100). The seed face itself is not included.
    async fn search_faces_by_id(
        &self,
        collection_id: &str,
        face_id: &str,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>, AnalysisError>;
}
