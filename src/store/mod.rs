//! Analysis Record Store contract.
//!
//! The pipeline owns this read/write contract but not the storage itself;
//! `sqlite` provides the production implementation and `memory` a
//! lightweight one for tests and embedding hosts.

mod memory;
mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    GalleryState, PersonCluster, PhotoAnalysisRecord, PhotoRef, StatusCounts,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    // === Photos ===

    /// Photos belonging to a gallery, the universe of analysis work.
    async fn list_photos(&self, gallery_id: &str) -> Result<Vec<PhotoRef>>;

    async fn get_photo(&self, photo_id: &str) -> Result<Option<PhotoRef>>;

    // === Analysis records ===

    async fn get_record(&self, photo_id: &str) -> Result<Option<PhotoAnalysisRecord>>;

    /// Create-or-replace the full record.
    async fn upsert_record(&self, record: &PhotoAnalysisRecord) -> Result<()>;

    /// Create a fresh PENDING record only when none exists. Never
    /// overwrites an existing record, whatever its status.
    async fn insert_pending_if_absent(&self, gallery_id: &str, photo_id: &str) -> Result<()>;

    async fn records_for_gallery(&self, gallery_id: &str) -> Result<Vec<PhotoAnalysisRecord>>;

    /// PROCESSING records not updated since `cutoff`, presumed abandoned.
    async fn stale_processing(
        &self,
        gallery_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PhotoAnalysisRecord>>;

    /// Status tallies recomputed from storage, never from memory.
    async fn status_counts(&self, gallery_id: &str) -> Result<StatusCounts>;

    // === Gallery aggregate ===

    async fn gallery_state(&self, gallery_id: &str) -> Result<GalleryState>;

    async fn set_progress(&self, gallery_id: &str, progress: u8) -> Result<()>;

    async fn set_search_enabled(&self, gallery_id: &str, enabled: bool) -> Result<()>;

    async fn set_face_collection(&self, gallery_id: &str, collection_id: &str) -> Result<()>;

    // === Person clusters ===

    async fn delete_clusters(&self, gallery_id: &str) -> Result<()>;

    async fn insert_cluster(&self, cluster: &PersonCluster) -> Result<()>;

    async fn clusters_for_gallery(&self, gallery_id: &str) -> Result<Vec<PersonCluster>>;
}
