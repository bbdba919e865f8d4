//! Shared data model for gallery analysis.

mod cluster;
mod record;

pub use cluster::PersonCluster;
pub use record::{
    AnalysisStatus, BoundingBox, DetectionSource, PersonFace, PhotoAnalysisRecord,
    PhotoAnalysisResult, StatusCounts,
};

use serde::{Deserialize, Serialize};

/// A photo row as the gallery knows it, enough to locate its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRef {
    pub photo_id: String,
    pub gallery_id: String,
    /// Preferred fetch location (smaller, faster to annotate).
    pub thumbnail_key: Option<String>,
    /// Fallback fetch location, always present.
    pub original_key: String,
}

/// Guess a MIME type from a storage key's extension, defaulting to JPEG.
pub fn mime_for_key(key: &str) -> &'static str {
    let key = key.to_lowercase();
    if key.ends_with(".png") {
        "image/png"
    } else if key.ends_with(".webp") {
        "image/webp"
    } else if key.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Gallery-level aggregate maintained by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryState {
    pub gallery_id: String,
    /// 0-100; 100 is reserved for a finished run.
    pub analysis_progress: u8,
    pub ai_search_enabled: bool,
    /// Lazily created embedding-index collection. None means face indexing
    /// is unavailable and clustering degrades to the role fallback.
    pub face_collection_id: Option<String>,
}

/// One search result, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub photo_id: String,
    pub relevance_score: f32,
    pub match_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_for_key() {
        assert_eq!(mime_for_key("photos/p1.jpg"), "image/jpeg");
        assert_eq!(mime_for_key("thumbs/p1.PNG"), "image/png");
        assert_eq!(mime_for_key("photos/p1.webp"), "image/webp");
        assert_eq!(mime_for_key("photos/no-extension"), "image/jpeg");
    }
}
