use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub annotator: AnnotatorConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Photos analyzed concurrently per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches, protecting the rate-limited annotator.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// PROCESSING records older than this are presumed abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,

    /// Rounds of the bounded retry loop.
    #[serde(default = "default_retry_rounds")]
    pub retry_rounds: u32,

    /// Exponential backoff base: round N waits base^N seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Extra pause before a retry round that includes rate-limit failures.
    #[serde(default = "default_rate_limit_pause_secs")]
    pub rate_limit_pause_secs: u64,
}

fn default_batch_size() -> usize {
    4
}

fn default_batch_delay_ms() -> u64 {
    2000
}

fn default_stale_after_secs() -> i64 {
    300
}

fn default_retry_rounds() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_rate_limit_pause_secs() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            stale_after_secs: default_stale_after_secs(),
            retry_rounds: default_retry_rounds(),
            backoff_base_secs: default_backoff_base_secs(),
            rate_limit_pause_secs: default_rate_limit_pause_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum CV detector confidence (0-100) for a face to be kept.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Padding added around a face box before cropping, as a fraction of
    /// the box size.
    #[serde(default = "default_crop_padding")]
    pub crop_padding: f32,

    /// Crops smaller than this on either side are not worth indexing.
    #[serde(default = "default_min_crop_px")]
    pub min_crop_px: u32,

    /// Similarity threshold (0-100) for the embedding index search.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_min_confidence() -> f32 {
    80.0
}

fn default_crop_padding() -> f32 {
    0.4
}

fn default_min_crop_px() -> u32 {
    20
}

fn default_similarity_threshold() -> f32 {
    80.0
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            crop_padding: default_crop_padding(),
            min_crop_px: default_min_crop_px(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatorConfig {
    #[serde(default = "default_annotator_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_annotator_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Deadline for an image annotation call.
    #[serde(default = "default_generate_timeout_ms")]
    pub generate_timeout_ms: u64,

    /// Deadline for a text-only re-ranking call.
    #[serde(default = "default_rank_timeout_ms")]
    pub rank_timeout_ms: u64,
}

fn default_annotator_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_annotator_model() -> String {
    "gemma-3-4b".to_string()
}

fn default_generate_timeout_ms() -> u64 {
    60_000
}

fn default_rank_timeout_ms() -> u64 {
    30_000
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_annotator_endpoint(),
            model: default_annotator_model(),
            api_key: None,
            generate_timeout_ms: default_generate_timeout_ms(),
            rank_timeout_ms: default_rank_timeout_ms(),
        }
    }
}

/// Endpoints for the remaining external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_detector_endpoint")]
    pub detector_endpoint: String,

    #[serde(default = "default_index_endpoint")]
    pub index_endpoint: String,

    #[serde(default = "default_image_store_endpoint")]
    pub image_store_endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Deadline for detector/index/store calls.
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_detector_endpoint() -> String {
    "http://127.0.0.1:7070".to_string()
}

fn default_index_endpoint() -> String {
    "http://127.0.0.1:7071".to_string()
}

fn default_image_store_endpoint() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_service_timeout_ms() -> u64 {
    30_000
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            detector_endpoint: default_detector_endpoint(),
            index_endpoint: default_index_endpoint(),
            image_store_endpoint: default_image_store_endpoint(),
            api_key: None,
            timeout_ms: default_service_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cap on lexical retrieval candidates fed to re-ranking.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Queries up to this many words may take the no-LLM fast path.
    #[serde(default = "default_fast_path_max_words")]
    pub fast_path_max_words: usize,

    /// Fast path also requires at most this many candidates.
    #[serde(default = "default_fast_path_max_candidates")]
    pub fast_path_max_candidates: usize,

    /// Re-ranked results below this score are dropped.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,
}

fn default_max_candidates() -> usize {
    50
}

fn default_fast_path_max_words() -> usize {
    2
}

fn default_fast_path_max_candidates() -> usize {
    10
}

fn default_min_relevance() -> f32 {
    0.3
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            fast_path_max_words: default_fast_path_max_words(),
            fast_path_max_candidates: default_fast_path_max_candidates(),
            min_relevance: default_min_relevance(),
        }
    }
}

impl AnalysisConfig {
    /// Load from a TOML file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AnalysisConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(AnalysisConfig::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
