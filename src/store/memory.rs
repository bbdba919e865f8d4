//! In-memory record store for tests and embedding hosts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::RecordStore;
use crate::model::{
    AnalysisStatus, GalleryState, PersonCluster, PhotoAnalysisRecord, PhotoRef, StatusCounts,
};

#[derive(Default)]
struct Inner {
    photos: Vec<PhotoRef>,
    records: HashMap<String, PhotoAnalysisRecord>,
    galleries: HashMap<String, GalleryState>,
    clusters: Vec<PersonCluster>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a photo row; galleries are created implicitly.
    pub fn add_photo(&self, photo: PhotoRef) {
        let mut inner = self.inner.lock().unwrap();
        let gallery_id = photo.gallery_id.clone();
        inner.photos.push(photo);
        inner
            .galleries
            .entry(gallery_id.clone())
            .or_insert_with(|| GalleryState {
                gallery_id,
                ..GalleryState::default()
            });
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_photos(&self, gallery_id: &str) -> Result<Vec<PhotoRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .photos
            .iter()
            .filter(|p| p.gallery_id == gallery_id)
            .cloned()
            .collect())
    }

    async fn get_photo(&self, photo_id: &str) -> Result<Option<PhotoRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .photos
            .iter()
            .find(|p| p.photo_id == photo_id)
            .cloned())
    }

    async fn get_record(&self, photo_id: &str) -> Result<Option<PhotoAnalysisRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(photo_id).cloned())
    }

    async fn upsert_record(&self, record: &PhotoAnalysisRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .records
            .insert(record.photo_id.clone(), record.clone());
        Ok(())
    }

    async fn insert_pending_if_absent(&self, gallery_id: &str, photo_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .records
            .entry(photo_id.to_string())
            .or_insert_with(|| PhotoAnalysisRecord::new_pending(gallery_id, photo_id));
        Ok(())
    }

    async fn records_for_gallery(&self, gallery_id: &str) -> Result<Vec<PhotoAnalysisRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.gallery_id == gallery_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.photo_id.cmp(&b.photo_id));
        Ok(records)
    }

    async fn stale_processing(
        &self,
        gallery_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PhotoAnalysisRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .values()
            .filter(|r| {
                r.gallery_id == gallery_id
                    && r.status == AnalysisStatus::Processing
                    && r.updated_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn status_counts(&self, gallery_id: &str) -> Result<StatusCounts> {
        let inner = self.inner.lock().unwrap();
        let mut counts = StatusCounts::default();
        for record in inner.records.values() {
            if record.gallery_id != gallery_id {
                continue;
            }
            match record.status {
                AnalysisStatus::Pending => counts.pending += 1,
                AnalysisStatus::Processing => counts.processing += 1,
                AnalysisStatus::Completed => counts.completed += 1,
                AnalysisStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn gallery_state(&self, gallery_id: &str) -> Result<GalleryState> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .galleries
            .entry(gallery_id.to_string())
            .or_insert_with(|| GalleryState {
                gallery_id: gallery_id.to_string(),
                ..GalleryState::default()
            })
            .clone())
    }

    async fn set_progress(&self, gallery_id: &str, progress: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.galleries.get_mut(gallery_id) {
            state.analysis_progress = progress;
        }
        Ok(())
    }

    async fn set_search_enabled(&self, gallery_id: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.galleries.get_mut(gallery_id) {
            state.ai_search_enabled = enabled;
        }
        Ok(())
    }

    async fn set_face_collection(&self, gallery_id: &str, collection_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.galleries.get_mut(gallery_id) {
            state.face_collection_id = Some(collection_id.to_string());
        }
        Ok(())
    }

    async fn delete_clusters(&self, gallery_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.clusters.retain(|c| c.gallery_id != gallery_id);
        Ok(())
    }

    async fn insert_cluster(&self, cluster: &PersonCluster) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.clusters.push(cluster.clone());
        Ok(())
    }

    async fn clusters_for_gallery(&self, gallery_id: &str) -> Result<Vec<PersonCluster>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .clusters
            .iter()
            .filter(|c| c.gallery_id == gallery_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(gallery: &str, id: &str) -> PhotoRef {
        PhotoRef {
            photo_id: id.to_string(),
            gallery_id: gallery.to_string(),
            thumbnail_key: None,
            original_key: format!("{}/{}.jpg", gallery, id),
        }
    }

    #[tokio::test]
    async fn test_insert_pending_if_absent_does_not_overwrite() {
        let store = MemoryRecordStore::new();
        store.add_photo(photo("g1", "p1"));

        let mut record = PhotoAnalysisRecord::new_pending("g1", "p1");
        record.transition(AnalysisStatus::Processing);
        record.transition(AnalysisStatus::Completed);
        store.upsert_record(&record).await.unwrap();

        store.insert_pending_if_absent("g1", "p1").await.unwrap();
        let fetched = store.get_record("p1").await.unwrap().unwrap();
        assert_eq!(fetched.status, AnalysisStatus::Completed);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = MemoryRecordStore::new();
        store.add_photo(photo("g1", "p1"));
        store.add_photo(photo("g1", "p2"));

        store.insert_pending_if_absent("g1", "p1").await.unwrap();
        let mut record = PhotoAnalysisRecord::new_pending("g1", "p2");
        record.transition(AnalysisStatus::Processing);
        record.transition(AnalysisStatus::Failed);
        store.upsert_record(&record).await.unwrap();

        let counts = store.status_counts("g1").await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.done(), 1);
    }
}
