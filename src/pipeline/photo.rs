//! Per-photo analysis stage.
//!
//! Runs the four-step pipeline (CV detection, LLM annotation, face
//! indexing, merge) for one photo and owns its record's state machine.
//! Always terminates by writing a COMPLETED or FAILED record and never
//! propagates an error to the caller.

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::AnalysisContext;
use crate::error::AnalysisError;
use crate::model::{
    mime_for_key, AnalysisStatus, BoundingBox, DetectionSource, PersonFace, PhotoAnalysisRecord,
    PhotoAnalysisResult, PhotoRef,
};
use crate::services::{AgeRange, DetectedFace};

/// The LLM's answer to the annotation prompt, before merging.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmAnalysis {
    #[serde(default)]
    description: String,
    #[serde(default)]
    people: Vec<LlmFace>,
    #[serde(default)]
    activities: Vec<String>,
    #[serde(default)]
    objects: Vec<String>,
    #[serde(default)]
    scene: Option<String>,
    #[serde(default)]
    mood: Option<String>,
    #[serde(default)]
    composition: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmFace {
    #[serde(default)]
    face_id: Option<String>,
    #[serde(default)]
    appearance: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    age_range: Option<String>,
    #[serde(default)]
    position: Option<BoundingBox>,
}

struct AnalyzedPhoto {
    analysis: PhotoAnalysisResult,
    faces: Vec<PersonFace>,
    search_tags: Vec<String>,
}

/// Analyze one photo end to end. Safe to call concurrently for different
/// photos; the record always ends the call COMPLETED or FAILED.
pub async fn analyze_photo(
    ctx: &AnalysisContext,
    gallery_id: &str,
    photo_id: &str,
    collection_id: Option<&str>,
) {
    let mut record = match ctx.store.get_record(photo_id).await {
        Ok(Some(record)) => record,
        Ok(None) => PhotoAnalysisRecord::new_pending(gallery_id, photo_id),
        Err(e) => {
            warn!(photo_id, error = %e, "failed to load analysis record");
            return;
        }
    };

    record.error_message = None;
    if !record.transition(AnalysisStatus::Processing) {
        // Another attempt owns this record right now.
        return;
    }
    if let Err(e) = ctx.store.upsert_record(&record).await {
        warn!(photo_id, error = %e, "failed to mark record processing");
        return;
    }

    match run_pipeline(ctx, photo_id, collection_id).await {
        Ok(outcome) => {
            record.description = Some(outcome.analysis.description.clone());
            record.face_count = outcome.faces.len();
            record.faces = outcome.faces;
            record.search_tags = outcome.search_tags;
            record.analysis = Some(outcome.analysis);
            record.error_message = None;
            record.analyzed_at = Some(Utc::now());
            record.transition(AnalysisStatus::Completed);
            info!(photo_id, faces = record.face_count, "photo analysis completed");
        }
        Err(e) => {
            record.error_message = Some(e.tagged());
            record.retry_count += 1;
            record.transition(AnalysisStatus::Failed);
            warn!(photo_id, code = e.code(), error = %e, "photo analysis failed");
        }
    }

    if let Err(e) = ctx.store.upsert_record(&record).await {
        warn!(photo_id, error = %e, "failed to persist analysis record");
    }
}

async fn run_pipeline(
    ctx: &AnalysisContext,
    photo_id: &str,
    collection_id: Option<&str>,
) -> Result<AnalyzedPhoto, AnalysisError> {
    let photo = ctx
        .store
        .get_photo(photo_id)
        .await
        .map_err(|e| AnalysisError::Unknown(e.to_string()))?
        .ok_or_else(|| AnalysisError::Image(format!("photo {} not found", photo_id)))?;

    let (bytes, mime_type) = fetch_image(ctx, &photo).await?;

    // CV stage: degrade to an LLM-only face list rather than aborting.
    let cv_faces = match ctx
        .detector
        .detect(&bytes, ctx.config.detection.min_confidence)
        .await
    {
        Ok(faces) => faces,
        Err(e) => {
            warn!(photo_id, error = %e, "face detection failed, continuing without CV faces");
            Vec::new()
        }
    };

    // LLM stage.
    let prompt = build_annotation_prompt(&cv_faces);
    let raw = ctx
        .annotator
        .generate(
            &bytes,
            mime_type,
            &prompt,
            Duration::from_millis(ctx.config.annotator.generate_timeout_ms),
        )
        .await?;
    let llm: LlmAnalysis = serde_json::from_str(strip_code_fences(&raw))
        .map_err(|e| AnalysisError::Parse(format!("annotator output: {}", e)))?;
    if llm.description.trim().is_empty() {
        return Err(AnalysisError::Validation(
            "annotator returned an empty description".to_string(),
        ));
    }

    let mut faces = merge_faces(&cv_faces, &llm);

    // Indexing stage: per-face best effort, only when CV geometry exists.
    if let Some(collection) = collection_id {
        if !cv_faces.is_empty() {
            index_faces(ctx, photo_id, collection, &bytes, &mut faces).await;
        }
    }

    let analysis = PhotoAnalysisResult {
        description: llm.description,
        people: faces.clone(),
        activities: llm.activities,
        objects: llm.objects,
        scene: llm.scene,
        mood: llm.mood,
        composition: llm.composition,
        tags: llm.tags,
    };
    let search_tags = extract_search_tags(&analysis);

    Ok(AnalyzedPhoto {
        analysis,
        faces,
        search_tags,
    })
}

/// Prefer the thumbnail location, fall back to the original. The MIME type
/// is derived from whichever key actually produced the bytes.
async fn fetch_image(
    ctx: &AnalysisContext,
    photo: &PhotoRef,
) -> Result<(Vec<u8>, &'static str), AnalysisError> {
    if let Some(ref key) = photo.thumbnail_key {
        match ctx.images.get(key).await {
            Ok(bytes) => return Ok((bytes, mime_for_key(key))),
            Err(e) => {
                debug!(photo_id = %photo.photo_id, key = %key, error = %e, "thumbnail fetch failed, trying original");
            }
        }
    }
    let bytes = ctx.images.get(&photo.original_key).await?;
    Ok((bytes, mime_for_key(&photo.original_key)))
}

async fn index_faces(
    ctx: &AnalysisContext,
    photo_id: &str,
    collection_id: &str,
    image_bytes: &[u8],
    faces: &mut [PersonFace],
) {
    let img = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(e) => {
            warn!(photo_id, error = %e, "cannot decode image for face crops, skipping indexing");
            return;
        }
    };

    for face in faces.iter_mut() {
        if face.detection_source != DetectionSource::Rekognition {
            continue;
        }
        let crop = match crop_face(
            &img,
            &face.position,
            ctx.config.detection.crop_padding,
            ctx.config.detection.min_crop_px,
        ) {
            Some(crop) => crop,
            None => {
                debug!(photo_id, face_id = %face.face_id, "face crop too small to index");
                continue;
            }
        };

        let external_id = format!("{}_{}", photo_id, face.face_id);
        match ctx
            .index
            .index_face(collection_id, &crop, &external_id)
            .await
        {
            Ok(Some(indexed)) => {
                face.embedding_face_id = Some(indexed.face_id);
            }
            Ok(None) => {
                debug!(photo_id, face_id = %face.face_id, "index found no face in crop");
            }
            Err(e) => {
                warn!(photo_id, face_id = %face.face_id, error = %e, "face indexing failed, skipping");
            }
        }
    }
}

/// The `face_N` correlation key shared by the detector ordering, the LLM
/// prompt, and the merge step. Index is zero-based.
fn expected_face_id(index: usize) -> String {
    format!("face_{}", index + 1)
}

fn build_annotation_prompt(cv_faces: &[DetectedFace]) -> String {
    let schema = r#"Return ONLY a JSON object, no other text, in this exact shape:
{
  "description": "<2-3 sentence natural description of the photo>",
  "people": [
    {
      "faceId": "face_1",
      "appearance": "<clothing, hair, distinguishing features>",
      "role": "<role at the event if evident, e.g. bride, groom, guest, or null>",
      "expression": "<one word, e.g. happy>",
      "ageRange": "<one of: child, teen, adult, senior>",
      "position": {"x": 0.0, "y": 0.0, "width": 0.0, "height": 0.0}
    }
  ],
  "activities": ["<what is happening>"],
  "objects": ["<notable objects>"],
  "scene": "<setting, e.g. beach, church, garden>",
  "mood": "<overall mood>",
  "composition": "<photographic style, e.g. candid, portrait>",
  "tags": ["<8-15 short search keywords>"]
}"#;

    if cv_faces.is_empty() {
        return format!(
            "Analyze this photograph for a searchable gallery.\n\
             If any people are visible, list each one in \"people\" with ids \
             face_1, face_2, ... and a normalized position (x, y, width, height \
             in [0,1] relative to the image).\n\n{}",
            schema
        );
    }

    let mut listing = String::new();
    for (i, face) in cv_faces.iter().enumerate() {
        let bbox = &face.bounding_box;
        listing.push_str(&format!(
            "{}: position x={:.3} y={:.3} width={:.3} height={:.3}",
            expected_face_id(i),
            bbox.x,
            bbox.y,
            bbox.width,
            bbox.height
        ));
        if let Some(age) = face.age_range {
            listing.push_str(&format!(", estimated age {}-{}", age.low, age.high));
        }
        if let Some(emotion) = face.top_emotion() {
            listing.push_str(&format!(", detected expression {}", emotion));
        }
        listing.push('\n');
    }

    format!(
        "Analyze this photograph for a searchable gallery.\n\
         A face detector found {} face(s), listed below with normalized \
         positions. Annotate EXACTLY these faces, keeping their faceId values \
         and positions unchanged. Do not add or remove faces.\n\n{}\n{}",
        cv_faces.len(),
        listing,
        schema
    )
}

/// Merge CV geometry with LLM annotations.
///
/// When CV faces exist they are authoritative for boxes and count; the
/// LLM annotation with the matching `face_N` id fills in the semantics,
/// with CV-derived fallbacks when the model omitted a face. Without CV
/// faces the LLM's own list is used as-is.
fn merge_faces(cv_faces: &[DetectedFace], llm: &LlmAnalysis) -> Vec<PersonFace> {
    if cv_faces.is_empty() {
        return llm
            .people
            .iter()
            .enumerate()
            .map(|(i, face)| PersonFace {
                face_id: face
                    .face_id
                    .clone()
                    .unwrap_or_else(|| expected_face_id(i)),
                appearance: face
                    .appearance
                    .clone()
                    .unwrap_or_else(|| "person".to_string()),
                role: face.role.clone(),
                expression: face.expression.clone(),
                age_range: face.age_range.clone(),
                position: face.position.unwrap_or(BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 0.0,
                    height: 0.0,
                }),
                confidence: None,
                detection_source: DetectionSource::Llm,
                embedding_face_id: None,
                person_cluster_id: None,
            })
            .collect();
    }

    cv_faces
        .iter()
        .enumerate()
        .map(|(i, detected)| {
            let expected = expected_face_id(i);
            let annotation = llm
                .people
                .iter()
                .find(|f| f.face_id.as_deref() == Some(expected.as_str()));

            PersonFace {
                face_id: expected,
                appearance: annotation
                    .and_then(|a| a.appearance.clone())
                    .unwrap_or_else(|| "person".to_string()),
                role: annotation.and_then(|a| a.role.clone()),
                expression: annotation
                    .and_then(|a| a.expression.clone())
                    .or_else(|| detected.top_emotion()),
                age_range: annotation
                    .and_then(|a| a.age_range.clone())
                    .or_else(|| Some(age_bucket(detected.age_range))),
                position: detected.bounding_box,
                confidence: Some(detected.confidence),
                detection_source: DetectionSource::Rekognition,
                embedding_face_id: None,
                person_cluster_id: None,
            }
        })
        .collect()
}

/// Bucket a detector age range into the coarse labels search uses.
fn age_bucket(range: Option<AgeRange>) -> String {
    let Some(range) = range else {
        return "adult".to_string();
    };
    let mid = (range.low + range.high) / 2;
    if mid < 13 {
        "child"
    } else if mid < 20 {
        "teen"
    } else if mid < 60 {
        "adult"
    } else {
        "senior"
    }
    .to_string()
}

/// Flatten every descriptive field into a deduplicated lower-cased tag set.
fn extract_search_tags(analysis: &PhotoAnalysisResult) -> Vec<String> {
    let mut tags = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |value: &str| {
        let tag = value.trim().to_lowercase();
        if !tag.is_empty() && seen.insert(tag.clone()) {
            tags.push(tag);
        }
    };

    for tag in &analysis.tags {
        push(tag);
    }
    for activity in &analysis.activities {
        push(activity);
    }
    for object in &analysis.objects {
        push(object);
    }
    if let Some(ref scene) = analysis.scene {
        push(scene);
    }
    if let Some(ref mood) = analysis.mood {
        push(mood);
    }
    if let Some(ref composition) = analysis.composition {
        push(composition);
    }
    for face in &analysis.people {
        if let Some(ref role) = face.role {
            push(role);
        }
        if let Some(ref expression) = face.expression {
            push(expression);
        }
        if let Some(ref age) = face.age_range {
            push(age);
        }
    }

    tags
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
pub(crate) fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(newline) = rest.find('\n') {
            let body = &rest[newline + 1..];
            if let Some(end) = body.rfind("```") {
                return body[..end].trim();
            }
        }
    }
    trimmed
}

/// Crop a normalized face box out of the image with padding, re-encoded
/// as JPEG. Returns None when the crop is too small to be worth indexing.
fn crop_face(
    img: &DynamicImage,
    bbox: &BoundingBox,
    padding: f32,
    min_px: u32,
) -> Option<Vec<u8>> {
    let (img_w, img_h) = (img.width() as f32, img.height() as f32);

    let face_w = bbox.width * img_w;
    let face_h = bbox.height * img_h;
    let pad_x = face_w * padding;
    let pad_y = face_h * padding;

    let x0 = (bbox.x * img_w - pad_x).max(0.0);
    let y0 = (bbox.y * img_h - pad_y).max(0.0);
    let x1 = (bbox.x * img_w + face_w + pad_x).min(img_w);
    let y1 = (bbox.y * img_h + face_h + pad_y).min(img_h);

    let crop_w = (x1 - x0) as u32;
    let crop_h = (y1 - y0) as u32;
    if crop_w < min_px || crop_h < min_px {
        return None;
    }

    let crop = img.crop_imm(x0 as u32, y0 as u32, crop_w, crop_h);
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 90);
    crop.write_with_encoder(encoder).ok()?;
    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::EmotionScore;

    fn detected(x: f32, y: f32, w: f32, h: f32) -> DetectedFace {
        DetectedFace {
            bounding_box: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
            confidence: 97.0,
            age_range: Some(AgeRange { low: 25, high: 35 }),
            emotions: vec![EmotionScore {
                name: "HAPPY".to_string(),
                confidence: 80.0,
            }],
        }
    }

    #[test]
    fn test_expected_face_id_is_one_based() {
        assert_eq!(expected_face_id(0), "face_1");
        assert_eq!(expected_face_id(2), "face_3");
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```\n{}\n```  "), "{}");
    }

    #[test]
    fn test_merge_prefers_llm_annotation() {
        let cv = vec![detected(0.1, 0.1, 0.3, 0.3)];
        let llm: LlmAnalysis = serde_json::from_str(
            r#"{
                "description": "x",
                "people": [{"faceId": "face_1", "appearance": "tall person in a suit",
                            "role": "groom", "expression": "smiling", "ageRange": "adult"}]
            }"#,
        )
        .unwrap();

        let merged = merge_faces(&cv, &llm);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].appearance, "tall person in a suit");
        assert_eq!(merged[0].role.as_deref(), Some("groom"));
        assert_eq!(merged[0].detection_source, DetectionSource::Rekognition);
        // CV box is authoritative even though the LLM sent none
        assert!((merged[0].position.x - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_merge_falls_back_to_cv_data() {
        let cv = vec![detected(0.1, 0.1, 0.3, 0.3), detected(0.5, 0.5, 0.2, 0.2)];
        // LLM only annotated face_2
        let llm: LlmAnalysis = serde_json::from_str(
            r#"{"description": "x",
                "people": [{"faceId": "face_2", "appearance": "child in yellow"}]}"#,
        )
        .unwrap();

        let merged = merge_faces(&cv, &llm);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].appearance, "person");
        assert_eq!(merged[0].expression.as_deref(), Some("happy"));
        assert_eq!(merged[0].age_range.as_deref(), Some("adult"));
        assert_eq!(merged[1].appearance, "child in yellow");
    }

    #[test]
    fn test_merge_llm_only() {
        let llm: LlmAnalysis = serde_json::from_str(
            r#"{"description": "x",
                "people": [{"appearance": "person by the window",
                            "position": {"x": 0.4, "y": 0.2, "width": 0.2, "height": 0.3}}]}"#,
        )
        .unwrap();

        let merged = merge_faces(&[], &llm);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].face_id, "face_1");
        assert_eq!(merged[0].detection_source, DetectionSource::Llm);
        assert!(merged[0].confidence.is_none());
    }

    #[test]
    fn test_age_bucket() {
        assert_eq!(age_bucket(Some(AgeRange { low: 4, high: 8 })), "child");
        assert_eq!(age_bucket(Some(AgeRange { low: 14, high: 18 })), "teen");
        assert_eq!(age_bucket(Some(AgeRange { low: 30, high: 45 })), "adult");
        assert_eq!(age_bucket(Some(AgeRange { low: 60, high: 80 })), "senior");
        assert_eq!(age_bucket(None), "adult");
    }

    #[test]
    fn test_extract_search_tags_dedup_and_case() {
        let analysis = PhotoAnalysisResult {
            description: "x".to_string(),
            people: vec![PersonFace {
                face_id: "face_1".to_string(),
                appearance: "a".to_string(),
                role: Some("Bride".to_string()),
                expression: Some("happy".to_string()),
                age_range: Some("adult".to_string()),
                position: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 0.1,
                    height: 0.1,
                },
                confidence: None,
                detection_source: DetectionSource::Llm,
                embedding_face_id: None,
                person_cluster_id: None,
            }],
            activities: vec!["Dancing".to_string()],
            objects: vec!["cake".to_string()],
            scene: Some("Garden".to_string()),
            mood: Some("joyful".to_string()),
            composition: Some("candid".to_string()),
            tags: vec!["wedding".to_string(), "GARDEN ".to_string()],
        };

        let tags = extract_search_tags(&analysis);
        assert!(tags.contains(&"wedding".to_string()));
        assert!(tags.contains(&"bride".to_string()));
        assert!(tags.contains(&"dancing".to_string()));
        // "GARDEN " and "Garden" collapse to one entry
        assert_eq!(tags.iter().filter(|t| *t == "garden").count(), 1);
        assert!(tags.iter().all(|t| t == &t.to_lowercase()));
    }

    #[test]
    fn test_crop_face_with_padding() {
        let img = DynamicImage::new_rgb8(200, 200);
        let bbox = BoundingBox {
            x: 0.25,
            y: 0.25,
            width: 0.25,
            height: 0.25,
        };
        let crop = crop_face(&img, &bbox, 0.4, 20).expect("crop should succeed");
        let decoded = image::load_from_memory(&crop).unwrap();
        // 50px face + 40% padding each side = 90px
        assert_eq!(decoded.width(), 90);
        assert_eq!(decoded.height(), 90);
    }

    #[test]
    fn test_crop_face_too_small_skipped() {
        let img = DynamicImage::new_rgb8(100, 100);
        let bbox = BoundingBox {
            x: 0.5,
            y: 0.5,
            width: 0.05,
            height: 0.05,
        };
        assert!(crop_face(&img, &bbox, 0.4, 20).is_none());
    }

    #[test]
    fn test_prompt_lists_cv_faces() {
        let prompt = build_annotation_prompt(&[detected(0.1, 0.2, 0.3, 0.4)]);
        assert!(prompt.contains("face_1"));
        assert!(prompt.contains("estimated age 25-35"));
        assert!(prompt.contains("keeping their faceId values"));

        let no_cv = build_annotation_prompt(&[]);
        assert!(no_cv.contains("list each one"));
    }
}
