//! Two-stage photo search: lexical retrieval, then optional LLM re-ranking.
//!
//! Availability beats ranking quality here: any re-ranking failure falls
//! back to the raw retrieval order instead of returning nothing.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::photo::strip_code_fences;
use super::AnalysisContext;
use crate::model::{AnalysisStatus, PhotoAnalysisRecord, SearchHit};

/// Retrieval candidate carried into re-ranking.
struct Candidate {
    photo_id: String,
    description: String,
    tags: Vec<String>,
    matched_tags: Vec<String>,
    score: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankedEntry {
    index: usize,
    relevance_score: f32,
    #[serde(default)]
    match_reason: String,
}

/// Answer a natural-language query against a gallery's completed analyses.
/// Results are ordered best-first with scores in [0, 1].
pub async fn search_gallery_photos(
    ctx: &AnalysisContext,
    gallery_id: &str,
    query: &str,
) -> Result<Vec<SearchHit>> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let records = ctx.store.records_for_gallery(gallery_id).await?;
    let candidates = lexical_candidates(&records, &tokens, ctx.config.search.max_candidates);
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    // Short queries over few candidates don't need a model.
    if tokens.len() <= ctx.config.search.fast_path_max_words
        && candidates.len() <= ctx.config.search.fast_path_max_candidates
    {
        debug!(gallery_id, query, candidates = candidates.len(), "search fast path");
        return Ok(retrieval_order_hits(&candidates, None));
    }

    match rerank(ctx, query, &candidates).await {
        Ok(hits) => Ok(hits),
        Err(e) => {
            warn!(gallery_id, query, error = %e, "re-ranking failed, returning retrieval order");
            Ok(retrieval_order_hits(
                &candidates,
                Some("Matched photo description"),
            ))
        }
    }
}

/// Lower-cased word tokens of the query; single characters carry no signal.
fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Score COMPLETED records by description token hits (weighted higher)
/// plus a binary tag-overlap bonus, best first, capped.
fn lexical_candidates(
    records: &[PhotoAnalysisRecord],
    tokens: &[String],
    cap: usize,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = records
        .iter()
        .filter(|r| r.status == AnalysisStatus::Completed)
        .filter_map(|record| {
            let description = record.description.clone().unwrap_or_default();
            let description_lower = description.to_lowercase();

            let hits = tokens
                .iter()
                .filter(|t| description_lower.contains(t.as_str()))
                .count();
            let text_rank = hits as f32 / tokens.len() as f32;

            let matched_tags: Vec<String> = record
                .search_tags
                .iter()
                .filter(|tag| tokens.contains(tag))
                .cloned()
                .collect();

            let score = 2.0 * text_rank + if matched_tags.is_empty() { 0.0 } else { 1.0 };
            if score <= 0.0 {
                return None;
            }
            Some(Candidate {
                photo_id: record.photo_id.clone(),
                description,
                tags: record.search_tags.clone(),
                matched_tags,
                score,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.photo_id.cmp(&b.photo_id))
    });
    candidates.truncate(cap);
    candidates
}

/// Hits in retrieval order with scores descending by a fixed step.
fn retrieval_order_hits(candidates: &[Candidate], reason_override: Option<&str>) -> Vec<SearchHit> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let match_reason = match reason_override {
                Some(reason) => reason.to_string(),
                None if !c.matched_tags.is_empty() => {
                    format!("Matched tags: {}", c.matched_tags.join(", "))
                }
                None => "Matched description".to_string(),
            };
            SearchHit {
                photo_id: c.photo_id.clone(),
                relevance_score: (0.95 - 0.05 * i as f32).max(0.1),
                match_reason,
            }
        })
        .collect()
}

async fn rerank(
    ctx: &AnalysisContext,
    query: &str,
    candidates: &[Candidate],
) -> Result<Vec<SearchHit>, crate::error::AnalysisError> {
    let prompt = build_rerank_prompt(query, candidates);
    let raw = ctx
        .annotator
        .rank(
            &prompt,
            Duration::from_millis(ctx.config.annotator.rank_timeout_ms),
        )
        .await?;

    let entries: Vec<RankedEntry> = serde_json::from_str(strip_code_fences(&raw))?;

    // A rambling model may list the same index twice; the first entry wins.
    let mut seen = HashSet::new();
    let mut hits: Vec<SearchHit> = entries
        .into_iter()
        .filter(|e| e.index < candidates.len())
        .filter(|e| e.relevance_score > ctx.config.search.min_relevance)
        .filter(|e| seen.insert(e.index))
        .map(|e| SearchHit {
            photo_id: candidates[e.index].photo_id.clone(),
            relevance_score: e.relevance_score.clamp(0.0, 1.0),
            match_reason: if e.match_reason.is_empty() {
                "Relevant to query".to_string()
            } else {
                e.match_reason
            },
        })
        .collect();

    hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    Ok(hits)
}

fn build_rerank_prompt(query: &str, candidates: &[Candidate]) -> String {
    let mut listing = String::new();
    for (i, c) in candidates.iter().enumerate() {
        let tags: Vec<&str> = c.tags.iter().take(10).map(String::as_str).collect();
        listing.push_str(&format!(
            "{}. {} [tags: {}]\n",
            i,
            truncate_chars(&c.description, 240),
            tags.join(", ")
        ));
    }

    format!(
        "A user is searching a photo gallery for: \"{}\"\n\n\
         Rate how relevant each photo below is to that query.\n\n{}\n\
         Return ONLY a JSON array, one entry per relevant photo:\n\
         [{{\"index\": 0, \"relevanceScore\": 0.0, \"matchReason\": \"<short reason>\"}}]\n\
         relevanceScore is between 0 and 1. Omit photos that are not relevant.",
        query, listing
    )
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completed(photo_id: &str, description: &str, tags: &[&str]) -> PhotoAnalysisRecord {
        let mut record = PhotoAnalysisRecord::new_pending("g1", photo_id);
        record.transition(AnalysisStatus::Processing);
        record.transition(AnalysisStatus::Completed);
        record.description = Some(description.to_string());
        record.search_tags = tags.iter().map(|t| t.to_string()).collect();
        record.analyzed_at = Some(Utc::now());
        record
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Sunset at the beach!"), vec!["sunset", "at", "the", "beach"]);
        assert_eq!(tokenize("a I"), Vec::<String>::new());
    }

    #[test]
    fn test_lexical_scoring_orders_by_relevance() {
        let records = vec![
            completed("p1", "A quiet garden portrait", &["garden", "portrait"]),
            completed("p2", "Dancing at the beach party", &["beach", "dancing"]),
            completed("p3", "Group photo indoors", &["indoors"]),
        ];

        let tokens = tokenize("beach dancing");
        let candidates = lexical_candidates(&records, &tokens, 50);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].photo_id, "p2");
        assert_eq!(candidates[0].matched_tags, vec!["beach", "dancing"]);
    }

    #[test]
    fn test_description_match_without_tags_still_scores() {
        let records = vec![completed("p1", "The bride walking down the aisle", &[])];
        let candidates = lexical_candidates(&records, &tokenize("bride"), 50);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].matched_tags.is_empty());
        assert!(candidates[0].score > 0.0);
    }

    #[test]
    fn test_candidates_capped() {
        let records: Vec<_> = (0..60)
            .map(|i| completed(&format!("p{:02}", i), "beach day", &["beach"]))
            .collect();
        let candidates = lexical_candidates(&records, &tokenize("beach"), 50);
        assert_eq!(candidates.len(), 50);
    }

    #[test]
    fn test_pending_records_excluded() {
        let pending = PhotoAnalysisRecord::new_pending("g1", "p1");
        let candidates = lexical_candidates(&[pending], &tokenize("anything"), 50);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_retrieval_order_scores_descend() {
        let records = vec![
            completed("p1", "beach", &["beach"]),
            completed("p2", "beach", &["beach"]),
        ];
        let candidates = lexical_candidates(&records, &tokenize("beach"), 50);
        let hits = retrieval_order_hits(&candidates, None);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].relevance_score > hits[1].relevance_score);
        assert!(hits[0].match_reason.contains("beach"));
    }
}
