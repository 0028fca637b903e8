//! Extract Runner, §4.5.3: stem separation, silent-stem tagging and archive
//! assembly.

use super::{classify_adapter_error, emit_progress, handle_mid_produce_cancellation, StageOutcome};
use crate::dedup::{ClaimKey, ClaimOutcome, ClaimResolution};
use crate::models::{ArtifactPatch, Extraction, ExtractionState, StemName};
use crate::queue::{Job, ResourceTag};
use crate::runners::RunnerContext;
use crate::store::BlobKind;
use async_trait::async_trait;
use chorus_common::{ClassifiedError, ErrorKind, Stage};
use std::collections::HashMap;
use std::io::Write;
use tokio_util::sync::CancellationToken;

pub struct ExtractRunner;

/// 95th-percentile short-term RMS in dBFS over 16-bit mono PCM, skipping the
/// WAV header. Offloaded to a blocking thread per §5's "blocking CPU-bound
/// work" policy, mirroring the teacher's `HashDeduplicator::calculate_hash`.
fn percentile_rms_dbfs(bytes: &[u8]) -> f64 {
    let samples = &bytes[bytes.len().min(44)..];
    let window = 4096usize;
    let mut levels: Vec<f64> = samples
        .chunks(window)
        .filter(|chunk| chunk.len() >= 2)
        .map(|chunk| {
            let mut sum_sq = 0.0f64;
            let mut count = 0usize;
            for pair in chunk.chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64 / i16::MAX as f64;
                sum_sq += sample * sample;
                count += 1;
            }
            if count == 0 {
                return f64::NEG_INFINITY;
            }
            let rms = (sum_sq / count as f64).sqrt();
            if rms <= 0.0 {
                -120.0
            } else {
                20.0 * rms.log10()
            }
        })
        .collect();
    if levels.is_empty() {
        return -120.0;
    }
    levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((levels.len() as f64) * 0.95).floor() as usize;
    levels[idx.min(levels.len() - 1)]
}

fn build_archive(stems: &HashMap<StemName, Vec<u8>>) -> chorus_common::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let mut names: Vec<_> = stems.keys().copied().collect();
        names.sort_by_key(|s| s.as_str());
        for name in names {
            let bytes = &stems[&name];
            writer
                .start_file(format!("{}.wav", name.as_str()), options)
                .map_err(|e| chorus_common::Error::Internal(e.to_string()))?;
            writer
                .write_all(bytes)
                .map_err(chorus_common::Error::Io)?;
        }
        writer
            .finish()
            .map_err(|e| chorus_common::Error::Internal(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl super::StageRunner for ExtractRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken, ctx: &RunnerContext) -> StageOutcome {
        let Some(model_id) = job.parameters.model_id.clone() else {
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "extract requires a model_id",
            ));
        };
        let key = ClaimKey::new(job.source_id.clone(), Stage::Extract, Some(&model_id));

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
                        StageOutcome::Failed(ClassifiedError::new(kind, "upstream extraction failed"))
                    }
                    None => StageOutcome::Failed(ClassifiedError::new(
                        ErrorKind::StorageFailure,
                        "dedup watch resolved with no outcome",
                    )),
                };
            }
            Ok(ClaimOutcome::Won) => {}
        }

        let record = match ctx.store.get_record(&job.source_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                ctx.dedup.release(&key, ClaimResolution::Failed(ErrorKind::BadInput)).await;
                return StageOutcome::Failed(ClassifiedError::new(
                    ErrorKind::BadInput,
                    "extract requested before fetch committed a record",
                ));
            }
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };
        let Some(audio_blob_ref) = record.audio_blob_ref.clone() else {
            ctx.dedup.release(&key, ClaimResolution::Failed(ErrorKind::BadInput)).await;
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "record has no master audio yet",
            ));
        };
        let audio_bytes = match ctx.store.open_blob(&audio_blob_ref).await {
            Ok(b) => b,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };

        // Persist the claim on disk before the long separation call so a
        // crash mid-extract leaves a `claimed`/`running` flag the Recovery
        // Manager can find and heal to `failed{interrupted}` at the next
        // startup (§4.2, §8 scenario 4) — without this, a crash here would
        // leave `extraction.state = none` and the orphaned claim would
        // never be reconciled.
        let claimed = Extraction {
            state: Some(ExtractionState::Claimed),
            model_id: Some(model_id.clone()),
            ..record.extraction.clone()
        };
        if let Err(e) = ctx
            .store
            .upsert_record(&job.source_id, ArtifactPatch { extraction: Some(claimed), ..Default::default() })
            .await
        {
            let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
            ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
            return StageOutcome::Failed(classified);
        }

        let requested_stems = if job.parameters.requested_stems.is_empty() {
            StemName::for_model(&model_id)
        } else {
            job.parameters.requested_stems.clone()
        };

        let resource_tag = if ctx.config.prefer_gpu && ctx.config.gpu_slots > 0 {
            ResourceTag::Gpu
        } else {
            ResourceTag::Cpu
        };
        emit_progress(
            ctx,
            job,
            "device_selected",
            0,
            Some(format!("{:?}", resource_tag)),
        )
        .await;

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        let running = Extraction {
            state: Some(ExtractionState::Running),
            model_id: Some(model_id.clone()),
            ..record.extraction.clone()
        };
        if let Err(e) = ctx
            .store
            .upsert_record(&job.source_id, ArtifactPatch { extraction: Some(running), ..Default::default() })
            .await
        {
            let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
            ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
            return StageOutcome::Failed(classified);
        }

        emit_progress(ctx, job, "separating", 10, None).await;
        let separated = match ctx
            .adapters
            .separator
            .separate(&audio_bytes, &model_id, &requested_stems)
            .await
        {
            Ok(stems) => stems,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::SeparatorFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };

        if separated.len() != requested_stems.len() || !requested_stems.iter().all(|s| separated.contains_key(s)) {
            let classified = ClassifiedError::new(
                ErrorKind::SeparatorFailure,
                "separator did not return every requested stem",
            );
            ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
            return StageOutcome::Failed(classified);
        }

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        emit_progress(ctx, job, "writing_stems", 40, None).await;
        let mut stem_refs = HashMap::new();
        let mut silent_stems = Vec::new();
        let total = separated.len().max(1);
        for (index, (stem, bytes)) in separated.iter().enumerate() {
            if cancel.is_cancelled() {
                return handle_mid_produce_cancellation(ctx, &key, job).await;
            }

            let rms_bytes = bytes.clone();
            let rms = match tokio::task::spawn_blocking(move || percentile_rms_dbfs(&rms_bytes)).await {
                Ok(v) => v,
                Err(_) => {
                    let classified = ClassifiedError::new(ErrorKind::StorageFailure, "rms computation task panicked");
                    ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                    return StageOutcome::Failed(classified);
                }
            };
            if rms < ctx.config.silent_stem_threshold_db {
                silent_stems.push(*stem);
            }

            let blob_ref = match ctx
                .store
                .put_blob(&job.source_id, BlobKind::Stem(*stem), "wav", bytes)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                    ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                    return StageOutcome::Failed(classified);
                }
            };
            stem_refs.insert(*stem, blob_ref);

            let percent = 40 + ((index + 1) * 30 / total) as u8;
            emit_progress(ctx, job, "writing_stems", percent, Some(stem.as_str().to_string())).await;
        }

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        emit_progress(ctx, job, "archiving", 80, None).await;
        let archive_bytes = match build_archive(&separated) {
            Ok(b) => b,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };
        let archive_ref = match ctx
            .store
            .put_blob(&job.source_id, BlobKind::Archive, "zip", &archive_bytes)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };

        if cancel.is_cancelled() {
            return handle_mid_produce_cancellation(ctx, &key, job).await;
        }

        let extraction = Extraction {
            state: Some(ExtractionState::Done),
            model_id: Some(model_id),
            stem_refs: Some(stem_refs),
            silent_stems,
            archive_ref: Some(archive_ref),
            completed_at: Some(chrono::Utc::now()),
        };
        let patch = ArtifactPatch {
            extraction: Some(extraction),
            ..Default::default()
        };
        let committed = match ctx.store.upsert_record(&job.source_id, patch).await {
            Ok(r) => r,
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::StorageFailure);
                ctx.dedup.release(&key, ClaimResolution::Failed(classified.kind)).await;
                return StageOutcome::Failed(classified);
            }
        };

        ctx.dedup
            .release(&key, ClaimResolution::Succeeded(Box::new(committed.clone())))
            .await;

        if let Err(e) = ctx.access.grant(&job.claimant_user_id, &job.source_id).await {
            return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure));
        }

        emit_progress(ctx, job, "extracted", 100, None).await;
        StageOutcome::Produced(Box::new(committed))
    }
}
