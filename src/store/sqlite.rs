//! SQLite-backed record store.
//!
//! Structured payloads (analysis result, face list, search tags) live in
//! JSON columns and are decoded at this boundary only.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::RecordStore;
use crate::model::{
    AnalysisStatus, GalleryState, PersonCluster, PhotoAnalysisRecord, PhotoRef, StatusCounts,
};

const SCHEMA: &str = r#"
-- Photo rows: enough to locate image bytes
CREATE TABLE IF NOT EXISTS photos (
    photo_id TEXT PRIMARY KEY,
    gallery_id TEXT NOT NULL,
    thumbnail_key TEXT,
    original_key TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_photos_gallery ON photos(gallery_id);

-- Per-photo analysis state
CREATE TABLE IF NOT EXISTS analysis_records (
    photo_id TEXT PRIMARY KEY,
    gallery_id TEXT NOT NULL,
    status TEXT NOT NULL,
    description TEXT,
    analysis TEXT,      -- JSON PhotoAnalysisResult
    search_tags TEXT NOT NULL DEFAULT '[]',  -- JSON array
    faces TEXT NOT NULL DEFAULT '[]',        -- JSON array of PersonFace
    face_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    analyzed_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_gallery ON analysis_records(gallery_id);
CREATE INDEX IF NOT EXISTS idx_records_status ON analysis_records(gallery_id, status);

-- Gallery aggregate
CREATE TABLE IF NOT EXISTS galleries (
    gallery_id TEXT PRIMARY KEY,
    analysis_progress INTEGER NOT NULL DEFAULT 0,
    ai_search_enabled INTEGER NOT NULL DEFAULT 0,
    face_collection_id TEXT
);

-- Person clusters, fully rebuilt per clustering run
CREATE TABLE IF NOT EXISTS person_clusters (
    id TEXT PRIMARY KEY,
    gallery_id TEXT NOT NULL,
    description TEXT NOT NULL,
    role TEXT,
    photo_ids TEXT NOT NULL,           -- JSON array
    face_description TEXT NOT NULL,
    embedding_face_ids TEXT NOT NULL,  -- JSON array
    representative_face_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_clusters_gallery ON person_clusters(gallery_id);
"#;

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a photo row; the gallery row is created implicitly.
    pub fn add_photo(&self, photo: &PhotoRef) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO photos (photo_id, gallery_id, thumbnail_key, original_key)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                photo.photo_id,
                photo.gallery_id,
                photo.thumbnail_key,
                photo.original_key
            ],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO galleries (gallery_id) VALUES (?1)",
            params![photo.gallery_id],
        )?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PhotoAnalysisRecord> {
    let status_str: String = row.get("status")?;
    let analysis_json: Option<String> = row.get("analysis")?;
    let search_tags_json: String = row.get("search_tags")?;
    let faces_json: String = row.get("faces")?;
    let analyzed_at: Option<String> = row.get("analyzed_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(PhotoAnalysisRecord {
        photo_id: row.get("photo_id")?,
        gallery_id: row.get("gallery_id")?,
        status: AnalysisStatus::parse(&status_str).unwrap_or(AnalysisStatus::Pending),
        description: row.get("description")?,
        analysis: analysis_json.and_then(|json| serde_json::from_str(&json).ok()),
        search_tags: serde_json::from_str(&search_tags_json).unwrap_or_default(),
        faces: serde_json::from_str(&faces_json).unwrap_or_default(),
        face_count: row.get::<_, i64>("face_count")? as usize,
        error_message: row.get("error_message")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        analyzed_at: analyzed_at.and_then(|s| parse_timestamp(&s).ok()),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_cluster(row: &Row<'_>) -> rusqlite::Result<PersonCluster> {
    let photo_ids: String = row.get("photo_ids")?;
    let embedding_face_ids: String = row.get("embedding_face_ids")?;
    Ok(PersonCluster {
        id: row.get("id")?,
        gallery_id: row.get("gallery_id")?,
        description: row.get("description")?,
        role: row.get("role")?,
        photo_ids: serde_json::from_str(&photo_ids).unwrap_or_default(),
        face_description: row.get("face_description")?,
        embedding_face_ids: serde_json::from_str(&embedding_face_ids).unwrap_or_default(),
        representative_face_id: row.get("representative_face_id")?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn list_photos(&self, gallery_id: &str) -> Result<Vec<PhotoRef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT photo_id, gallery_id, thumbnail_key, original_key
             FROM photos WHERE gallery_id = ?1 ORDER BY photo_id",
        )?;
        let photos = stmt
            .query_map([gallery_id], |row| {
                Ok(PhotoRef {
                    photo_id: row.get(0)?,
                    gallery_id: row.get(1)?,
                    thumbnail_key: row.get(2)?,
                    original_key: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    async fn get_photo(&self, photo_id: &str) -> Result<Option<PhotoRef>> {
        let conn = self.conn.lock().unwrap();
        let photo = conn
            .query_row(
                "SELECT photo_id, gallery_id, thumbnail_key, original_key
                 FROM photos WHERE photo_id = ?1",
                [photo_id],
                |row| {
                    Ok(PhotoRef {
                        photo_id: row.get(0)?,
                        gallery_id: row.get(1)?,
                        thumbnail_key: row.get(2)?,
                        original_key: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(photo)
    }

    async fn get_record(&self, photo_id: &str) -> Result<Option<PhotoAnalysisRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM analysis_records WHERE photo_id = ?1",
                [photo_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    async fn upsert_record(&self, record: &PhotoAnalysisRecord) -> Result<()> {
        let analysis = record
            .analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let search_tags = serde_json::to_string(&record.search_tags)?;
        let faces = serde_json::to_string(&record.faces)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO analysis_records
             (photo_id, gallery_id, status, description, analysis, search_tags, faces,
              face_count, error_message, retry_count, analyzed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.photo_id,
                record.gallery_id,
                record.status.as_str(),
                record.description,
                analysis,
                search_tags,
                faces,
                record.face_count as i64,
                record.error_message,
                record.retry_count as i64,
                record.analyzed_at.map(|t| t.to_rfc3339()),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn insert_pending_if_absent(&self, gallery_id: &str, photo_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO analysis_records
             (photo_id, gallery_id, status, updated_at)
             VALUES (?1, ?2, 'PENDING', ?3)",
            params![photo_id, gallery_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn records_for_gallery(&self, gallery_id: &str) -> Result<Vec<PhotoAnalysisRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM analysis_records WHERE gallery_id = ?1 ORDER BY photo_id")?;
        let records = stmt
            .query_map([gallery_id], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn stale_processing(
        &self,
        gallery_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PhotoAnalysisRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_records
             WHERE gallery_id = ?1 AND status = 'PROCESSING' AND updated_at < ?2",
        )?;
        let records = stmt
            .query_map(params![gallery_id, cutoff.to_rfc3339()], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn status_counts(&self, gallery_id: &str) -> Result<StatusCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM analysis_records
             WHERE gallery_id = ?1 GROUP BY status",
        )?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([gallery_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "PENDING" => counts.pending = count,
                "PROCESSING" => counts.processing = count,
                "COMPLETED" => counts.completed = count,
                "FAILED" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn gallery_state(&self, gallery_id: &str) -> Result<GalleryState> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO galleries (gallery_id) VALUES (?1)",
            [gallery_id],
        )?;
        conn.query_row(
            "SELECT gallery_id, analysis_progress, ai_search_enabled, face_collection_id
             FROM galleries WHERE gallery_id = ?1",
            [gallery_id],
            |row| {
                Ok(GalleryState {
                    gallery_id: row.get(0)?,
                    analysis_progress: row.get::<_, i64>(1)? as u8,
                    ai_search_enabled: row.get::<_, i64>(2)? != 0,
                    face_collection_id: row.get(3)?,
                })
            },
        )
        .map_err(|e| anyhow!("failed to load gallery {}: {}", gallery_id, e))
    }

    async fn set_progress(&self, gallery_id: &str, progress: u8) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE galleries SET analysis_progress = ?2 WHERE gallery_id = ?1",
            params![gallery_id, progress as i64],
        )?;
        Ok(())
    }

    async fn set_search_enabled(&self, gallery_id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE galleries SET ai_search_enabled = ?2 WHERE gallery_id = ?1",
            params![gallery_id, enabled as i64],
        )?;
        Ok(())
    }

    async fn set_face_collection(&self, gallery_id: &str, collection_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE galleries SET face_collection_id = ?2 WHERE gallery_id = ?1",
            params![gallery_id, collection_id],
        )?;
        Ok(())
    }

    async fn delete_clusters(&self, gallery_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM person_clusters WHERE gallery_id = ?1",
            [gallery_id],
        )?;
        Ok(())
    }

    async fn insert_cluster(&self, cluster: &PersonCluster) -> Result<()> {
        let photo_ids = serde_json::to_string(&cluster.photo_ids)?;
        let embedding_face_ids = serde_json::to_string(&cluster.embedding_face_ids)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO person_clusters
             (id, gallery_id, description, role, photo_ids, face_description,
              embedding_face_ids, representative_face_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                cluster.id,
                cluster.gallery_id,
                cluster.description,
                cluster.role,
                photo_ids,
                cluster.face_description,
                embedding_face_ids,
                cluster.representative_face_id,
            ],
        )?;
        Ok(())
    }

    async fn clusters_for_gallery(&self, gallery_id: &str) -> Result<Vec<PersonCluster>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM person_clusters WHERE gallery_id = ?1 ORDER BY id")?;
        let clusters = stmt
            .query_map([gallery_id], row_to_cluster)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingBox, DetectionSource, PersonFace, PhotoAnalysisResult};
    use chrono::Duration;

    fn sample_face() -> PersonFace {
        PersonFace {
            face_id: "face_1".to_string(),
            appearance: "person in a red dress".to_string(),
            role: Some("bride".to_string()),
            expression: Some("happy".to_string()),
            age_range: Some("adult".to_string()),
            position: BoundingBox {
                x: 0.2,
                y: 0.1,
                width: 0.25,
                height: 0.35,
            },
            confidence: Some(98.5),
            detection_source: DetectionSource::Rekognition,
            embedding_face_id: Some("emb-1".to_string()),
            person_cluster_id: None,
        }
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("analysis.db")).unwrap();

        let mut record = PhotoAnalysisRecord::new_pending("g1", "p1");
        record.transition(AnalysisStatus::Processing);
        record.description = Some("A wedding ceremony".to_string());
        record.analysis = Some(PhotoAnalysisResult {
            description: "A wedding ceremony".to_string(),
            people: vec![sample_face()],
            tags: vec!["wedding".to_string()],
            ..PhotoAnalysisResult::default()
        });
        record.faces = vec![sample_face()];
        record.face_count = 1;
        record.search_tags = vec!["wedding".to_string(), "bride".to_string()];
        record.transition(AnalysisStatus::Completed);
        record.analyzed_at = Some(Utc::now());
        store.upsert_record(&record).await.unwrap();

        let fetched = store.get_record("p1").await.unwrap().unwrap();
        assert_eq!(fetched.status, AnalysisStatus::Completed);
        assert_eq!(fetched.face_count, 1);
        assert_eq!(fetched.faces[0].face_id, "face_1");
        assert_eq!(
            fetched.faces[0].embedding_face_id.as_deref(),
            Some("emb-1")
        );
        assert_eq!(fetched.search_tags.len(), 2);
        assert!(fetched.analyzed_at.is_some());
    }

    #[tokio::test]
    async fn test_insert_pending_if_absent() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert_pending_if_absent("g1", "p1").await.unwrap();
        store.insert_pending_if_absent("g1", "p1").await.unwrap();

        let mut record = store.get_record("p1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Pending);

        record.transition(AnalysisStatus::Processing);
        record.transition(AnalysisStatus::Failed);
        record.retry_count = 2;
        store.upsert_record(&record).await.unwrap();

        // insert-if-absent must not reset the failed record
        store.insert_pending_if_absent("g1", "p1").await.unwrap();
        let fetched = store.get_record("p1").await.unwrap().unwrap();
        assert_eq!(fetched.status, AnalysisStatus::Failed);
        assert_eq!(fetched.retry_count, 2);
    }

    #[tokio::test]
    async fn test_stale_processing_query() {
        let store = SqliteRecordStore::open_in_memory().unwrap();

        let mut stale = PhotoAnalysisRecord::new_pending("g1", "old");
        stale.transition(AnalysisStatus::Processing);
        stale.updated_at = Utc::now() - Duration::minutes(10);
        store.upsert_record(&stale).await.unwrap();

        let mut fresh = PhotoAnalysisRecord::new_pending("g1", "new");
        fresh.transition(AnalysisStatus::Processing);
        store.upsert_record(&fresh).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(5);
        let found = store.stale_processing("g1", cutoff).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].photo_id, "old");
    }

    #[tokio::test]
    async fn test_gallery_state_and_clusters() {
        let store = SqliteRecordStore::open_in_memory().unwrap();

        let state = store.gallery_state("g1").await.unwrap();
        assert_eq!(state.analysis_progress, 0);
        assert!(!state.ai_search_enabled);

        store.set_face_collection("g1", "coll-1").await.unwrap();
        store.set_progress("g1", 100).await.unwrap();
        store.set_search_enabled("g1", true).await.unwrap();

        let state = store.gallery_state("g1").await.unwrap();
        assert_eq!(state.face_collection_id.as_deref(), Some("coll-1"));
        assert_eq!(state.analysis_progress, 100);
        assert!(state.ai_search_enabled);

        let cluster = PersonCluster {
            id: "c1".to_string(),
            gallery_id: "g1".to_string(),
            description: "bride, appears in 2 photos".to_string(),
            role: Some("bride".to_string()),
            photo_ids: vec!["p1".to_string(), "p2".to_string()],
            face_description: "person in a red dress".to_string(),
            embedding_face_ids: vec!["emb-1".to_string(), "emb-2".to_string()],
            representative_face_id: Some("emb-1".to_string()),
        };
        store.insert_cluster(&cluster).await.unwrap();

        let clusters = store.clusters_for_gallery("g1").await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].photo_ids.len(), 2);

        store.delete_clusters("g1").await.unwrap();
        assert!(store.clusters_for_gallery("g1").await.unwrap().is_empty());
    }
}
