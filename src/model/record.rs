//! Per-photo analysis record and its nested payloads.
//!
//! These are the durable shapes persisted by the record store. Structured
//! payloads (`PhotoAnalysisResult`, `PersonFace`) serialize to camelCase
//! JSON at the store boundary; internal code always works with the typed
//! forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a photo's analysis.
///
/// Legal transitions: PENDING→PROCESSING, PROCESSING→{COMPLETED, FAILED},
/// FAILED→PENDING (retry) and PROCESSING→PENDING (stale reset). COMPLETED
/// is terminal for a run; a fresh orchestrator pass may still re-enter it
/// through PENDING when the photo is re-analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "PENDING",
            AnalysisStatus::Processing => "PROCESSING",
            AnalysisStatus::Completed => "COMPLETED",
            AnalysisStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AnalysisStatus::Pending),
            "PROCESSING" => Some(AnalysisStatus::Processing),
            "COMPLETED" => Some(AnalysisStatus::Completed),
            "FAILED" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition(&self, next: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
                | (Failed, Processing)
                | (Completed, Pending)
        )
    }
}

/// Normalized bounding box, all fields in [0, 1] relative to image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Which system produced a face's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    /// Dedicated CV detector; authoritative for boxes.
    Rekognition,
    /// Vision-language model proposed the face itself.
    Llm,
}

/// One detected person within a photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonFace {
    /// Stable within the photo: `face_1`, `face_2`, ... in detector order.
    /// The LLM prompt/response correlation and the embedding index both
    /// rely on this ordering contract.
    pub face_id: String,
    pub appearance: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub age_range: Option<String>,
    pub position: BoundingBox,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub detection_source: DetectionSource,
    /// Opaque id from the face embedding index, set during indexing.
    #[serde(default)]
    pub embedding_face_id: Option<String>,
    /// Set by the clustering engine after the gallery run.
    #[serde(default)]
    pub person_cluster_id: Option<String>,
}

/// Full structured result of a photo analysis: the LLM output merged with
/// CV face data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoAnalysisResult {
    pub description: String,
    #[serde(default)]
    pub people: Vec<PersonFace>,
    #[serde(default)]
    pub activities: Vec<String>,
    #[serde(default)]
    pub objects: Vec<String>,
    #[serde(default)]
    pub scene: Option<String>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub composition: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Durable per-photo state, keyed by photo id within a gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoAnalysisRecord {
    pub photo_id: String,
    pub gallery_id: String,
    pub status: AnalysisStatus,
    pub description: Option<String>,
    pub analysis: Option<PhotoAnalysisResult>,
    pub search_tags: Vec<String>,
    pub faces: Vec<PersonFace>,
    pub face_count: usize,
    /// `[CODE] message` when status is FAILED.
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoAnalysisRecord {
    pub fn new_pending(gallery_id: &str, photo_id: &str) -> Self {
        Self {
            photo_id: photo_id.to_string(),
            gallery_id: gallery_id.to_string(),
            status: AnalysisStatus::Pending,
            description: None,
            analysis: None,
            search_tags: Vec::new(),
            faces: Vec::new(),
            face_count: 0,
            error_message: None,
            retry_count: 0,
            analyzed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Guarded status change. Illegal transitions are refused and logged so
    /// a buggy caller cannot silently clobber another attempt's state.
    pub fn transition(&mut self, next: AnalysisStatus) -> bool {
        if self.status == next {
            // A concurrent attempt already holds this state; back off.
            return false;
        }
        if !self.status.can_transition(next) {
            tracing::warn!(
                photo_id = %self.photo_id,
                from = self.status.as_str(),
                to = next.as_str(),
                "refusing illegal analysis status transition"
            );
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Gallery-wide status tallies, always recomputed from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn done(&self) -> usize {
        self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisStatus::Failed,
        ] {
            assert_eq!(AnalysisStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AnalysisStatus::parse("bogus"), None);
    }

    #[test]
    fn test_transition_guards() {
        let mut rec = PhotoAnalysisRecord::new_pending("g1", "p1");
        assert!(!rec.transition(AnalysisStatus::Completed));
        assert_eq!(rec.status, AnalysisStatus::Pending);

        assert!(rec.transition(AnalysisStatus::Processing));
        assert!(rec.transition(AnalysisStatus::Failed));
        assert!(rec.transition(AnalysisStatus::Pending));
        assert!(rec.transition(AnalysisStatus::Processing));
        assert!(rec.transition(AnalysisStatus::Completed));
        assert!(!rec.transition(AnalysisStatus::Failed));
    }

    #[test]
    fn test_stale_processing_can_reset() {
        let mut rec = PhotoAnalysisRecord::new_pending("g1", "p1");
        rec.transition(AnalysisStatus::Processing);
        assert!(rec.transition(AnalysisStatus::Pending));
    }

    #[test]
    fn test_face_serializes_camel_case() {
        let face = PersonFace {
            face_id: "face_1".to_string(),
            appearance: "person in a blue jacket".to_string(),
            role: Some("bride".to_string()),
            expression: Some("happy".to_string()),
            age_range: Some("adult".to_string()),
            position: BoundingBox {
                x: 0.1,
                y: 0.2,
                width: 0.3,
                height: 0.4,
            },
            confidence: Some(99.2),
            detection_source: DetectionSource::Rekognition,
            embedding_face_id: None,
            person_cluster_id: None,
        };
        let json = serde_json::to_value(&face).unwrap();
        assert_eq!(json["faceId"], "face_1");
        assert_eq!(json["detectionSource"], "rekognition");
        assert_eq!(json["ageRange"], "adult");
    }
}
