//! Gallery-wide analysis orchestration.
//!
//! Idempotent and resumable: all coordination state lives in the record
//! store and is re-read after every batch, so a crashed run can simply be
//! invoked again.

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{cluster_persons, photo::analyze_photo, AnalysisContext};
use crate::error::AnalysisError;
use crate::model::AnalysisStatus;

/// Analyze every photo in a gallery, retry transient failures, finalize
/// progress, and rebuild person clusters.
///
/// Per-photo failures never abort the run; only record-store failures
/// propagate (the calling job runner owns retrying the run itself).
pub async fn analyze_gallery(ctx: &AnalysisContext, gallery_id: &str) -> Result<()> {
    info!(gallery_id, "starting gallery analysis");

    // Face collection is optional: without it, analysis still runs and
    // clustering later degrades to the role fallback.
    let collection_id = ensure_face_collection(ctx, gallery_id).await?;

    reset_stale_records(ctx, gallery_id).await?;

    let photos = ctx.store.list_photos(gallery_id).await?;
    let total = photos.len();
    for photo in &photos {
        ctx.store
            .insert_pending_if_absent(gallery_id, &photo.photo_id)
            .await?;
    }

    let work: Vec<String> = ctx
        .store
        .records_for_gallery(gallery_id)
        .await?
        .into_iter()
        .filter(|r| r.status != AnalysisStatus::Completed)
        .map(|r| r.photo_id)
        .collect();

    if work.is_empty() {
        // Nothing to analyze; clusters from the previous run remain valid
        // and no record may change on a re-run.
        let counts = ctx.store.status_counts(gallery_id).await?;
        ctx.store.set_progress(gallery_id, 100).await?;
        ctx.store
            .set_search_enabled(gallery_id, counts.completed > 0)
            .await?;
        info!(gallery_id, "gallery already analyzed, nothing to do");
        return Ok(());
    }

    info!(gallery_id, total, pending = work.len(), "gallery work discovered");
    run_batches(ctx, gallery_id, &work, collection_id.as_deref(), total).await?;

    retry_failed(ctx, gallery_id, collection_id.as_deref(), total).await?;

    // Finalization: 100 marks a finished run even with permanent failures;
    // one analyzed photo is enough to make the gallery searchable.
    let counts = ctx.store.status_counts(gallery_id).await?;
    ctx.store.set_progress(gallery_id, 100).await?;
    ctx.store
        .set_search_enabled(gallery_id, counts.completed > 0)
        .await?;
    info!(
        gallery_id,
        completed = counts.completed,
        failed = counts.failed,
        "gallery analysis finished"
    );

    if let Err(e) = cluster_persons(ctx, gallery_id).await {
        warn!(gallery_id, error = %e, "person clustering failed, continuing");
    }

    Ok(())
}

async fn ensure_face_collection(
    ctx: &AnalysisContext,
    gallery_id: &str,
) -> Result<Option<String>> {
    let state = ctx.store.gallery_state(gallery_id).await?;
    if let Some(id) = state.face_collection_id {
        return Ok(Some(id));
    }

    let id = format!("gallery-{}", gallery_id);
    match ctx.index.create_collection(&id).await {
        Ok(()) => {
            ctx.store.set_face_collection(gallery_id, &id).await?;
            Ok(Some(id))
        }
        Err(e) => {
            warn!(gallery_id, error = %e, "face collection unavailable, analyzing without indexing");
            Ok(None)
        }
    }
}

/// A prior run may have crashed mid-photo; PROCESSING must never block
/// forward progress indefinitely.
async fn reset_stale_records(ctx: &AnalysisContext, gallery_id: &str) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::seconds(ctx.config.orchestrator.stale_after_secs);
    for mut record in ctx.store.stale_processing(gallery_id, cutoff).await? {
        warn!(
            gallery_id,
            photo_id = %record.photo_id,
            "resetting stale PROCESSING record"
        );
        record.error_message =
            Some("reset after exceeding the PROCESSING staleness window".to_string());
        if record.transition(AnalysisStatus::Pending) {
            ctx.store.upsert_record(&record).await?;
        }
    }
    Ok(())
}

/// Sequential batches, concurrent photos inside a batch, progress
/// recomputed from the store after every batch.
async fn run_batches(
    ctx: &AnalysisContext,
    gallery_id: &str,
    photo_ids: &[String],
    collection_id: Option<&str>,
    total: usize,
) -> Result<()> {
    let batch_size = ctx.config.orchestrator.batch_size.max(1);

    for (batch_no, batch) in photo_ids.chunks(batch_size).enumerate() {
        if batch_no > 0 {
            tokio::time::sleep(Duration::from_millis(ctx.config.orchestrator.batch_delay_ms))
                .await;
        }

        debug!(gallery_id, batch = batch_no, size = batch.len(), "running analysis batch");
        join_all(
            batch
                .iter()
                .map(|photo_id| analyze_photo(ctx, gallery_id, photo_id, collection_id)),
        )
        .await;

        let counts = ctx.store.status_counts(gallery_id).await?;
        let progress = if total == 0 {
            99
        } else {
            // 100 is reserved for true completion.
            ((counts.done() as f64 / total as f64) * 100.0).round().min(99.0) as u8
        };
        ctx.store.set_progress(gallery_id, progress).await?;
    }

    Ok(())
}

/// Bounded retry loop over transient failures.
async fn retry_failed(
    ctx: &AnalysisContext,
    gallery_id: &str,
    collection_id: Option<&str>,
    total: usize,
) -> Result<()> {
    for round in 1..=ctx.config.orchestrator.retry_rounds {
        let eligible: Vec<_> = ctx
            .store
            .records_for_gallery(gallery_id)
            .await?
            .into_iter()
            .filter(|r| {
                r.status == AnalysisStatus::Failed
                    && r.retry_count <= round
                    && r.error_message
                        .as_deref()
                        .map(AnalysisError::message_is_retryable)
                        .unwrap_or(false)
            })
            .collect();

        if eligible.is_empty() {
            break;
        }

        let rate_limited = eligible.iter().any(|r| {
            r.error_message
                .as_deref()
                .map(AnalysisError::message_is_rate_limit)
                .unwrap_or(false)
        });
        if rate_limited {
            debug!(gallery_id, round, "rate-limit failures present, extra pause before retry");
            tokio::time::sleep(Duration::from_secs(
                ctx.config.orchestrator.rate_limit_pause_secs,
            ))
            .await;
        }
        tokio::time::sleep(Duration::from_secs(
            ctx.config.orchestrator.backoff_base_secs.pow(round),
        ))
        .await;

        info!(gallery_id, round, retrying = eligible.len(), "retry round starting");
        let mut photo_ids = Vec::with_capacity(eligible.len());
        for mut record in eligible {
            record.error_message = None;
            if record.transition(AnalysisStatus::Pending) {
                ctx.store.upsert_record(&record).await?;
                photo_ids.push(record.photo_id);
            }
        }

        run_batches(ctx, gallery_id, &photo_ids, collection_id, total).await?;
    }

    Ok(())
}
