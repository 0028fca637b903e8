//! Post-Extract Runner, §4.5.4: lyrics refinement from isolated vocals.
//! Always overwrites `analysis.lyrics`, since vocals-isolated input is
//! higher quality than anything analyze could produce from the mixed master.

use super::{classify_adapter_error, emit_progress, StageOutcome};
use crate::models::{ArtifactPatch, LyricsSource};
use crate::queue::Job;
use crate::runners::RunnerContext;
use async_trait::async_trait;
use chorus_common::{ClassifiedError, ErrorKind};
use tokio_util::sync::CancellationToken;

pub struct PostExtractRunner;

#[async_trait]
impl super::StageRunner for PostExtractRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken, ctx: &RunnerContext) -> StageOutcome {
        let record = match ctx.store.get_record(&job.source_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                return StageOutcome::Failed(ClassifiedError::new(
                    ErrorKind::BadInput,
                    "post_extract requested before extract committed a record",
                ))
            }
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        };
        let Some(stem_refs) = record.extraction.stem_refs.clone() else {
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "record has no stems to read lyrics from",
            ));
        };
        let Some(vocals_ref) = stem_refs.get(&crate::models::StemName::Vocals).cloned() else {
            return StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::BadInput,
                "extraction did not include a vocals stem",
            ));
        };
        let vocals_bytes = match ctx.store.open_blob(&vocals_ref).await {
            Ok(b) => b,
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        };

        let title = record.title.clone().unwrap_or_default();
        let duration = record.duration_seconds.unwrap_or(0.0);

        emit_progress(ctx, job, "lyrics_lookup", 10, None).await;
        let external = match ctx.adapters.lyrics_provider.lookup(&title, duration).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, source_id = %job.source_id, "external lyrics re-lookup failed");
                None
            }
        };

        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        let (mut doc, source) = match external {
            Some(doc) => (doc, LyricsSource::ExternalApi),
            None => {
                if !ctx.config.lyrics_asr_enabled {
                    return StageOutcome::Failed(ClassifiedError::new(
                        ErrorKind::BadInput,
                        "no external lyrics and ASR is disabled",
                    ));
                }
                emit_progress(ctx, job, "transcribing", 40, None).await;
                match ctx.adapters.asr.transcribe(&vocals_bytes).await {
                    Ok(doc) => (doc, LyricsSource::Asr),
                    Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::AnalyzerFailure)),
                }
            }
        };

        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        emit_progress(ctx, job, "aligning", 70, None).await;
        doc = match ctx.adapters.vocal_onset.refine(&vocals_bytes, doc).await {
            Ok(refined) => refined,
            Err(e) => {
                tracing::warn!(error = %e, source_id = %job.source_id, "onset refinement failed, keeping unrefined timings");
                doc
            }
        };

        let mut analysis = record.analysis.clone();
        analysis.lyrics = Some(doc);
        analysis.lyrics_source = Some(source);

        let patch = ArtifactPatch {
            analysis: Some(analysis),
            ..Default::default()
        };
        let committed = match ctx.store.upsert_record(&job.source_id, patch).await {
            Ok(r) => r,
            Err(e) => return StageOutcome::Failed(classify_adapter_error(&e, ErrorKind::StorageFailure)),
        };

        emit_progress(ctx, job, "post_extracted", 100, None).await;
        StageOutcome::Produced(Box::new(committed))
    }
}
