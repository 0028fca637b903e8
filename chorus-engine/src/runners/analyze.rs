//! Analyze Runner, §4.5.2: tempo/key, chords, structure and (external-only)
//! lyrics, each independently failable and separately claimed, committed
//! once as a single patch.
//!
//! Per the Open Questions decision recorded in DESIGN.md, pre-extract
//! analysis is committed eagerly and reused: a sub-step whose field is
//! already populated on the stored record is skipped entirely rather than
//! re-run, which is also what makes repeated `analyze` requests for an
//! already-analyzed source cheap.

use super::{classify_adapter_error, emit_progress, StageOutcome};
use crate::dedup::{ClaimKey, ClaimOutcome, ClaimResolution};
use crate::models::{Analysis, ArtifactPatch, ChordsSource, LyricsSource};
use crate::queue::Job;
use crate::runners::RunnerContext;
use async_trait::async_trait;
use chorus_common::{ClassifiedError, ErrorKind, Stage};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct AnalyzeRunner;

/// Runs one deduplicated analysis sub-step. `produce` is only invoked by
/// the winner of the claim; a subscriber instead waits for the winner's
/// `release` and reloads the field it cares about from the store.
async fn run_substep<T, F, Fut>(
    ctx: &RunnerContext,
    job: &Job,
    cancel: &CancellationToken,
    phase: &'static str,
    produce: F,
) -> Result<Option<T>, StageOutcome>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, chorus_common::Error>>,
{
    let key = ClaimKey::new(job.source_id.clone(), Stage::Analyze, Some(phase));
    match ctx.dedup.claim(key.clone(), job.job_id).await {
        Err(e) => Err(StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure))),
        Ok(ClaimOutcome::AlreadyDone(_)) => {
            // Analyze sub-steps never report AlreadyDone from the dedup
            // index itself (that branch is specific to extract); reaching
            // here would indicate a programming error, not a real state.
            Ok(None)
        }
        Ok(ClaimOutcome::AlreadyInProgress(mut rx)) => {
            tokio::select! {
                _ = cancel.cancelled() => Err(StageOutcome::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(StageOutcome::Failed(ClassifiedError::new(
                            ErrorKind::StorageFailure,
                            "dedup watch channel closed without a resolution",
                        )));
                    }
                    match rx.borrow().clone() {
                        Some(ClaimResolution::Failed(kind)) => Err(StageOutcome::Failed(ClassifiedError::new(
                            kind,
                            format!("upstream {phase} analysis failed"),
                        ))),
                        _ => Ok(None), // winner committed the field; caller reloads from the store
                    }
                }
            }
        }
        Ok(ClaimOutcome::Won) => match produce().await {
            Ok(value) => {
                ctx.dedup
                    .release(&key, ClaimResolution::Succeeded(Box::new(crate::models::ArtifactRecord::new(&job.source_id))))
                    .await;
                Ok(Some(value))
            }
            Err(e) => {
                let classified = classify_adapter_error(&e, ErrorKind::AnalyzerFailure);
                ctx.dedup
                    .release(&key, ClaimResolution::Failed(classified.kind))
                    .await;
                Err(StageOutcome::Failed(classified))
            }
        },
    }
}

#[async_trait]
impl super::StageRunner for AnalyzeRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken, ctx: &RunnerContext) -> StageOutcome {
        let Some(record) = (match ctx.store.get_record(&job.source_id).await {
            Ok(r) => r,
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        }) else {
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "analyze requested before fetch committed a record",
            ));
        };
        let Some(audio_blob_ref) = record.audio_blob_ref.clone() else {
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "record has no master audio yet",
            ));
        };
        let audio_bytes = match ctx.store.open_blob(&audio_blob_ref).await {
            Ok(b) => b,
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        };
        let duration = record.duration_seconds.unwrap_or(0.0);
        let title = record.title.clone().unwrap_or_default();

        let mut analysis: Analysis = record.analysis.clone();

        // 1. Tempo & key — must run before chords, which may consume the
        // tempo as a beat-grid hint.
        if analysis.tempo_bpm.is_none() {
            emit_progress(ctx, job, "tempo_key", 10, None).await;
            let bytes = audio_bytes.clone();
            match run_substep(ctx, job, cancel, "tempo_key", || async move {
                ctx.adapters.tempo_key.analyze(&bytes).await
            })
            .await
            {
                Ok(Some(result)) => {
                    analysis.tempo_bpm = Some(result.tempo_bpm);
                    analysis.key = Some(result.key);
                    analysis.beat_offset_seconds = result.beat_offset_seconds;
                    analysis.analysis_confidence = Some(result.confidence);
                }
                Ok(None) => {
                    if let Some(reloaded) = reload(ctx, &job.source_id).await {
                        analysis.tempo_bpm = reloaded.tempo_bpm;
                        analysis.key = reloaded.key;
                        analysis.beat_offset_seconds = reloaded.beat_offset_seconds;
                        analysis.analysis_confidence = reloaded.analysis_confidence;
                    }
                }
                Err(outcome) => return outcome,
            }
        }

        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        // 2. Chords — a `chord_backend_override` forces a re-run even when a
        // prior analysis already committed a result, since that's the whole
        // point of `request_regenerate_chords`.
        let force_chord_rerun = job.parameters.chord_backend_override.is_some();
        if analysis.chords.is_none() || force_chord_rerun {
            emit_progress(ctx, job, "chords", 35, None).await;
            let bytes = audio_bytes.clone();
            let tempo_hint = analysis.tempo_bpm;
            let backend_override = job.parameters.chord_backend_override.clone();
            let phase: &'static str = if force_chord_rerun { "chords_regenerate" } else { "chords" };
            match run_substep(ctx, job, cancel, phase, || async move {
                ctx.adapters
                    .resolve_chords_with_override(&bytes, tempo_hint, backend_override.as_deref())
                    .await
            })
            .await
            {
                Ok(Some(Some((backend, events)))) => {
                    analysis.chords = Some(events);
                    analysis.chords_source = Some(match backend.as_str() {
                        "primary" => ChordsSource::Primary,
                        "hybrid" => ChordsSource::Hybrid,
                        _ => ChordsSource::Fallback,
                    });
                }
                Ok(Some(None)) => {
                    analysis.chords = Some(Vec::new());
                    analysis.chords_source = Some(ChordsSource::None);
                }
                Ok(None) => {
                    if let Some(reloaded) = reload(ctx, &job.source_id).await {
                        analysis.chords = reloaded.chords;
                        analysis.chords_source = reloaded.chords_source;
                    }
                }
                Err(outcome) => return outcome,
            }
        }

        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        // 3. Structure — non-fatal: a failure leaves it null rather than
        // failing the whole analyze job.
        if analysis.structure.is_none() {
            emit_progress(ctx, job, "structure", 60, None).await;
            let bytes = audio_bytes.clone();
            let key = ClaimKey::new(job.source_id.clone(), Stage::Analyze, Some("structure"));
            match ctx.dedup.claim(key.clone(), job.job_id).await {
                Ok(ClaimOutcome::Won) => {
                    match ctx.adapters.segmenter.analyze(&bytes, duration).await {
                        Ok(sections) => {
                            analysis.structure = Some(sections);
                            ctx.dedup
                                .release(&key, ClaimResolution::Succeeded(Box::new(record.clone())))
                                .await;
                        }
                        Err(e) => {
                            warn!(error = %e, source_id = %job.source_id, "structure segmentation failed, leaving null");
                            ctx.dedup
                                .release(&key, ClaimResolution::Failed(ErrorKind::AnalyzerFailure))
                                .await;
                        }
                    }
                }
                Ok(ClaimOutcome::AlreadyInProgress(mut rx)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return StageOutcome::Cancelled,
                        _ = rx.changed() => {
                            if let Some(reloaded) = reload(ctx, &job.source_id).await {
                                analysis.structure = reloaded.structure;
                            }
                        }
                    }
                }
                Ok(ClaimOutcome::AlreadyDone(_)) => {}
                Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
            }
        }

        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        // 4. Lyrics, external source only — absence is not failure; the
        // post-extract stage fills this in from isolated vocals.
        if analysis.lyrics.is_none() {
            emit_progress(ctx, job, "lyrics", 85, None).await;
            let key = ClaimKey::new(job.source_id.clone(), Stage::Analyze, Some("lyrics"));
            match ctx.dedup.claim(key.clone(), job.job_id).await {
                Ok(ClaimOutcome::Won) => {
                    match ctx.adapters.lyrics_provider.lookup(&title, duration).await {
                        Ok(Some(doc)) => {
                            analysis.lyrics = Some(doc);
                            analysis.lyrics_source = Some(LyricsSource::ExternalApi);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, source_id = %job.source_id, "external lyrics lookup failed, deferring to post-extract");
                        }
                    }
                    ctx.dedup
                        .release(&key, ClaimResolution::Succeeded(Box::new(record.clone())))
                        .await;
                }
                Ok(ClaimOutcome::AlreadyInProgress(mut rx)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return StageOutcome::Cancelled,
                        _ = rx.changed() => {
                            if let Some(reloaded) = reload(ctx, &job.source_id).await {
                                analysis.lyrics = reloaded.lyrics;
                                analysis.lyrics_source = reloaded.lyrics_source;
                            }
                        }
                    }
                }
                Ok(ClaimOutcome::AlreadyDone(_)) => {}
                Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
            }
        }

        let patch = ArtifactPatch {
            analysis: Some(analysis),
            ..Default::default()
        };
        let committed = match ctx.store.upsert_record(&job.source_id, patch).await {
            Ok(r) => r,
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        };

        if let Err(e) = ctx.access.grant(&job.claimant_user_id, &job.source_id).await {
            return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure));
        }

        emit_progress(ctx, job, "analyzed", 100, None).await;
        StageOutcome::Produced(Box::new(committed))
    }
}

async fn reload(ctx: &RunnerContext, source_id: &str) -> Option<Analysis> {
    ctx.store
        .get_record(source_id)
        .await
        .ok()
        .flatten()
        .map(|r| r.analysis)
}
