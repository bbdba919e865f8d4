//! Cross-photo person identity clusters.

use serde::{Deserialize, Serialize};

/// One recurring person within a gallery.
///
/// Clusters are rebuilt from scratch on every clustering run, so ids are
/// not stable across runs; membership is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonCluster {
    pub id: String,
    pub gallery_id: String,
    /// Human-readable summary, e.g. "bride, appears in 12 photos".
    pub description: String,
    /// Majority vote over member faces, first-seen wins ties.
    pub role: Option<String>,
    /// Deduplicated photos this person appears in.
    pub photo_ids: Vec<String>,
    /// Appearance text of the representative face.
    pub face_description: String,
    /// Embedding-index ids of every member face. Empty for clusters built
    /// by the role fallback.
    pub embedding_face_ids: Vec<String>,
    pub representative_face_id: Option<String>,
}

impl PersonCluster {
    pub fn contains_photo(&self, photo_id: &str) -> bool {
        self.photo_ids.iter().any(|p| p == photo_id)
    }
}
