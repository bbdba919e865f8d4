//! Person clustering engine.
//!
//! Groups every detected face in a gallery into person clusters, preferring
//! embedding similarity and falling back to exact role matching for faces
//! the index never saw. Clusters are deleted and fully rebuilt on each run,
//! so the engine is idempotent over a fixed set of completed analyses.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AnalysisContext;
use crate::model::{AnalysisStatus, PersonCluster, PersonFace};

/// Roles distinctive enough to identify a person without an embedding.
/// Generic roles like "guest" would over-group, so they are excluded.
const KEY_ROLES: &[&str] = &["bride", "groom", "celebrant", "host", "speaker", "performer"];

struct FaceEntry {
    photo_id: String,
    face: PersonFace,
}

/// Rebuild all person clusters for a gallery and write membership back
/// onto the face records.
///
/// Embedding clustering is a single-pass connected-components construction
/// driven by the external similarity oracle. The match relation is not
/// transitive, so the resulting clusters are consistent by construction
/// but not a true equivalence-class partition; that trade-off is
/// intentional and matches what "the same person" means to users.
pub async fn cluster_persons(ctx: &AnalysisContext, gallery_id: &str) -> Result<()> {
    ctx.store.delete_clusters(gallery_id).await?;

    let records = ctx.store.records_for_gallery(gallery_id).await?;
    let entries: Vec<FaceEntry> = records
        .iter()
        .filter(|r| r.status == AnalysisStatus::Completed && r.face_count > 0)
        .flat_map(|r| {
            r.faces.iter().map(|face| FaceEntry {
                photo_id: r.photo_id.clone(),
                face: face.clone(),
            })
        })
        .collect();

    if entries.is_empty() {
        debug!(gallery_id, "no faces to cluster");
        return Ok(());
    }

    let state = ctx.store.gallery_state(gallery_id).await?;
    let mut clusters = Vec::new();

    let has_embeddings = entries.iter().any(|e| e.face.embedding_face_id.is_some());
    if has_embeddings {
        if let Some(ref collection_id) = state.face_collection_id {
            cluster_by_embedding(ctx, gallery_id, collection_id, &entries, &mut clusters).await;
        }
    }

    cluster_by_role(gallery_id, &entries, &mut clusters);

    for cluster in &clusters {
        ctx.store.insert_cluster(cluster).await?;
    }
    info!(
        gallery_id,
        clusters = clusters.len(),
        faces = entries.len(),
        "person clusters rebuilt"
    );

    assign_cluster_ids(ctx, gallery_id, &clusters, &records).await?;
    Ok(())
}

/// Connected components over the similarity oracle, threshold from config.
async fn cluster_by_embedding(
    ctx: &AnalysisContext,
    gallery_id: &str,
    collection_id: &str,
    entries: &[FaceEntry],
    clusters: &mut Vec<PersonCluster>,
) {
    // An embedding id normally maps to one face, but a flaky re-index can
    // produce duplicates; keep all of them together.
    let mut by_embedding: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        if let Some(ref id) = entry.face.embedding_face_id {
            by_embedding.entry(id).or_default().push(i);
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    for entry in entries {
        let Some(ref seed_id) = entry.face.embedding_face_id else {
            continue;
        };
        if visited.contains(seed_id.as_str()) {
            continue;
        }
        visited.insert(seed_id.clone());

        let matches = match ctx
            .index
            .search_faces_by_id(
                collection_id,
                seed_id,
                ctx.config.detection.similarity_threshold,
            )
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(gallery_id, face = %seed_id, error = %e, "similarity search failed, face becomes its own cluster");
                Vec::new()
            }
        };

        let mut member_ids = vec![seed_id.clone()];
        for matched in matches {
            if visited.contains(&matched.face_id) || !by_embedding.contains_key(matched.face_id.as_str()) {
                continue;
            }
            visited.insert(matched.face_id.clone());
            member_ids.push(matched.face_id);
        }

        let members: Vec<&FaceEntry> = member_ids
            .iter()
            .flat_map(|id| by_embedding[id.as_str()].iter().map(|&i| &entries[i]))
            .collect();

        clusters.push(build_cluster(gallery_id, &members, member_ids));
    }
}

/// Faces the index never saw can still be grouped when they carry a
/// distinctive role. Runs in addition to the embedding pass and only over
/// embedding-less faces, so the two passes cannot collide.
fn cluster_by_role(gallery_id: &str, entries: &[FaceEntry], clusters: &mut Vec<PersonCluster>) {
    let mut groups: Vec<(String, Vec<&FaceEntry>)> = Vec::new();
    for entry in entries {
        if entry.face.embedding_face_id.is_some() {
            continue;
        }
        let Some(ref role) = entry.face.role else {
            continue;
        };
        let role = role.trim().to_lowercase();
        if !KEY_ROLES.contains(&role.as_str()) {
            continue;
        }
        match groups.iter_mut().find(|(r, _)| *r == role) {
            Some((_, members)) => members.push(entry),
            None => groups.push((role, vec![entry])),
        }
    }

    for (_, members) in groups {
        clusters.push(build_cluster(gallery_id, &members, Vec::new()));
    }
}

fn build_cluster(
    gallery_id: &str,
    members: &[&FaceEntry],
    embedding_face_ids: Vec<String>,
) -> PersonCluster {
    let role = majority_role(members);

    let mut photo_ids = Vec::new();
    for member in members {
        if !photo_ids.contains(&member.photo_id) {
            photo_ids.push(member.photo_id.clone());
        }
    }

    let representative = members.first();
    let face_description = representative
        .map(|m| m.face.appearance.clone())
        .unwrap_or_default();
    let representative_face_id = representative.map(|m| {
        m.face
            .embedding_face_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", m.photo_id, m.face.face_id))
    });

    let description = format!(
        "{}, appears in {} photo(s)",
        role.as_deref().unwrap_or("person"),
        photo_ids.len()
    );

    PersonCluster {
        id: Uuid::new_v4().to_string(),
        gallery_id: gallery_id.to_string(),
        description,
        role,
        photo_ids,
        face_description,
        embedding_face_ids,
        representative_face_id,
    }
}

/// Majority vote over member roles; ties resolved by first-seen order.
fn majority_role(members: &[&FaceEntry]) -> Option<String> {
    let mut ordered: Vec<(String, usize)> = Vec::new();
    for member in members {
        let Some(ref role) = member.face.role else {
            continue;
        };
        let role = role.trim().to_lowercase();
        if role.is_empty() {
            continue;
        }
        match ordered.iter_mut().find(|(r, _)| *r == role) {
            Some((_, count)) => *count += 1,
            None => ordered.push((role, 1)),
        }
    }
    // max_by_key would pick the last of equal maxima; ties must go to the
    // first role seen.
    let mut best: Option<(String, usize)> = None;
    for (role, count) in ordered {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((role, count)),
        }
    }
    best.map(|(role, _)| role)
}

/// Write `person_cluster_id` back onto every completed record's faces.
/// Embedding-id lookup wins; role + photo membership is the fallback for
/// faces the index never saw. Only mutated records are persisted.
async fn assign_cluster_ids(
    ctx: &AnalysisContext,
    gallery_id: &str,
    clusters: &[PersonCluster],
    records: &[crate::model::PhotoAnalysisRecord],
) -> Result<()> {
    let mut by_embedding: HashMap<&str, &str> = HashMap::new();
    for cluster in clusters {
        for id in &cluster.embedding_face_ids {
            by_embedding.insert(id, &cluster.id);
        }
    }

    for record in records {
        if record.status != AnalysisStatus::Completed || record.faces.is_empty() {
            continue;
        }

        let mut updated = record.clone();
        let mut mutated = false;
        for face in &mut updated.faces {
            let fresh = resolve_cluster(face, &record.photo_id, &by_embedding, clusters);
            if face.person_cluster_id != fresh {
                face.person_cluster_id = fresh;
                mutated = true;
            }
        }

        if mutated {
            updated.analysis = updated.analysis.map(|mut analysis| {
                analysis.people = updated.faces.clone();
                analysis
            });
            ctx.store.upsert_record(&updated).await?;
            debug!(gallery_id, photo_id = %record.photo_id, "face cluster ids updated");
        }
    }

    Ok(())
}

fn resolve_cluster(
    face: &PersonFace,
    photo_id: &str,
    by_embedding: &HashMap<&str, &str>,
    clusters: &[PersonCluster],
) -> Option<String> {
    if let Some(ref embedding_id) = face.embedding_face_id {
        return by_embedding.get(embedding_id.as_str()).map(|id| id.to_string());
    }

    let role = face.role.as_deref()?.trim().to_lowercase();
    clusters
        .iter()
        .find(|c| c.role.as_deref() == Some(role.as_str()) && c.contains_photo(photo_id))
        .map(|c| c.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingBox, DetectionSource};

    fn entry(photo: &str, role: Option<&str>, embedding: Option<&str>) -> FaceEntry {
        FaceEntry {
            photo_id: photo.to_string(),
            face: PersonFace {
                face_id: "face_1".to_string(),
                appearance: "person".to_string(),
                role: role.map(str::to_string),
                expression: None,
                age_range: None,
                position: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 0.1,
                    height: 0.1,
                },
                confidence: None,
                detection_source: DetectionSource::Rekognition,
                embedding_face_id: embedding.map(str::to_string),
                person_cluster_id: None,
            },
        }
    }

    #[test]
    fn test_majority_role_first_seen_tie_break() {
        let a = entry("p1", Some("bride"), None);
        let b = entry("p2", Some("guest"), None);
        let c = entry("p3", Some("bride"), None);
        assert_eq!(
            majority_role(&[&a, &b, &c]),
            Some("bride".to_string())
        );

        // Tie: bride seen first wins
        let d = entry("p4", Some("guest"), None);
        assert_eq!(
            majority_role(&[&a, &b, &c, &d]),
            Some("bride".to_string())
        );

        assert_eq!(majority_role(&[&entry("p1", None, None)]), None);
    }

    #[test]
    fn test_role_fallback_only_key_roles_without_embeddings() {
        let mut clusters = Vec::new();
        let entries = vec![
            entry("p1", Some("bride"), None),
            entry("p2", Some("bride"), None),
            entry("p3", Some("guest"), None),
            // embedding-bearing faces are the embedding pass's business
            entry("p4", Some("bride"), Some("emb-1")),
        ];
        cluster_by_role("g1", &entries, &mut clusters);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].role.as_deref(), Some("bride"));
        assert_eq!(clusters[0].photo_ids, vec!["p1", "p2"]);
        assert!(clusters[0].embedding_face_ids.is_empty());
    }

    #[test]
    fn test_build_cluster_dedups_photos() {
        let a = entry("p1", Some("groom"), Some("e1"));
        let b = entry("p1", Some("groom"), Some("e2"));
        let c = entry("p2", Some("groom"), Some("e3"));
        let cluster = build_cluster(
            "g1",
            &[&a, &b, &c],
            vec!["e1".to_string(), "e2".to_string(), "e3".to_string()],
        );
        assert_eq!(cluster.photo_ids, vec!["p1", "p2"]);
        assert_eq!(cluster.role.as_deref(), Some("groom"));
        assert_eq!(cluster.representative_face_id.as_deref(), Some("e1"));
        assert!(cluster.description.contains("2 photo(s)"));
    }
}
