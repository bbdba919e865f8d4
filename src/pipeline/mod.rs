//! The gallery analysis pipeline: orchestrator, per-photo stage,
//! clustering engine, and search engine.

mod clustering;
mod orchestrator;
mod photo;
mod search;

pub use clustering::cluster_persons;
pub use orchestrator::analyze_gallery;
pub use photo::analyze_photo;
pub use search::search_gallery_photos;

use std::sync::Arc;

use crate::config::AnalysisConfig;
use crate::services::{FaceDetector, FaceIndex, ImageStore, VisionAnnotator};
use crate::store::RecordStore;

/// Dependency bundle shared by every pipeline component. All collaborators
/// are trait objects so hosts and tests can inject their own.
#[derive(Clone)]
pub struct AnalysisContext {
    pub store: Arc<dyn RecordStore>,
    pub images: Arc<dyn ImageStore>,
    pub detector: Arc<dyn FaceDetector>,
    pub annotator: Arc<dyn VisionAnnotator>,
    pub index: Arc<dyn FaceIndex>,
    pub config: AnalysisConfig,
}
