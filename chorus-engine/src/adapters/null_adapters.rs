//! Offline reference adapters satisfying every capability trait with
//! deterministic, dependency-free output, so the stage-runner state
//! machine can be exercised end to end without real ML binaries or
//! network access — the same role the teacher's in-repo test fixtures
//! (generated WAV files, `tempfile` dirs) play for its import pipeline
//! tests.

use super::{
    Asr, AudioCodec, Availability, ChordAnalyzer, FetchedSource, LyricsProvider, Segmenter,
    Separator, SourceFetcher, SourceMetadata, SourceSummary, TempoKeyAnalyzer, TempoKeyResult,
    VocalOnset,
};
use crate::models::{ChordEvent, LyricsDoc, Section, StemName};
use async_trait::async_trait;
use chorus_common::Result;
use std::collections::HashMap;

/// Builds a minimal mono 16-bit PCM WAV file of silence, enough for
/// downstream code to treat as valid audio bytes without a real encoder.
fn silent_wav(duration_seconds: f64, sample_rate: u32) -> Vec<u8> {
    let num_samples = (duration_seconds * sample_rate as f64).max(0.0) as u32;
    let data_size = num_samples * 2;
    let mut buf = Vec::with_capacity(44 + data_size as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    buf.resize(buf.len() + data_size as usize, 0);
    buf
}

pub struct NullSourceFetcher;

#[async_trait]
impl SourceFetcher for NullSourceFetcher {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn search(&self, _query: &str) -> Result<Vec<SourceSummary>> {
        Ok(Vec::new())
    }

    async fn fetch(&self, source_id: &str) -> Result<FetchedSource> {
        Ok(FetchedSource {
            metadata: SourceMetadata {
                title: format!("Untitled ({source_id})"),
                duration_seconds: 30.0,
                thumbnail_ref: None,
            },
            audio_bytes: silent_wav(30.0, 44_100),
            ext: "wav".to_string(),
        })
    }
}

pub struct PassthroughAudioCodec;

#[async_trait]
impl AudioCodec for PassthroughAudioCodec {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    fn is_canonical(&self, ext: &str) -> bool {
        ext.eq_ignore_ascii_case("wav")
    }

    async fn transcode(&self, bytes: &[u8], _source_ext: &str) -> Result<(Vec<u8>, String)> {
        Ok((bytes.to_vec(), "wav".to_string()))
    }
}

pub struct NullSeparator;

#[async_trait]
impl Separator for NullSeparator {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn separate(
        &self,
        audio_bytes: &[u8],
        _model_id: &str,
        requested_stems: &[StemName],
    ) -> Result<HashMap<StemName, Vec<u8>>> {
        let approx_seconds = (audio_bytes.len().saturating_sub(44) / 2) as f64 / 44_100.0;
        Ok(requested_stems
            .iter()
            .map(|stem| (*stem, silent_wav(approx_seconds, 44_100)))
            .collect())
    }
}

pub struct NullTempoKeyAnalyzer;

#[async_trait]
impl TempoKeyAnalyzer for NullTempoKeyAnalyzer {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn analyze(&self, _audio_bytes: &[u8]) -> Result<TempoKeyResult> {
        Ok(TempoKeyResult {
            tempo_bpm: 120.0,
            key: "C major".to_string(),
            beat_offset_seconds: 0.0,
            confidence: 0.5,
        })
    }
}

/// Always reports a single unlabeled-chord event; real backends return
/// the vocabulary described in §3's data model.
pub struct NullChordAnalyzer {
    name: &'static str,
}

impl NullChordAnalyzer {
    pub fn named(name: &str) -> Self {
        let name: &'static str = match name {
            "primary" => "primary",
            "secondary" => "secondary",
            "hybrid" => "hybrid",
            _ => "null",
        };
        Self { name }
    }
}

#[async_trait]
impl ChordAnalyzer for NullChordAnalyzer {
    fn backend_name(&self) -> &'static str {
        self.name
    }

    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn analyze(
        &self,
        _audio_bytes: &[u8],
        _tempo_hint: Option<f64>,
    ) -> Result<Vec<ChordEvent>> {
        Ok(vec![ChordEvent {
            timestamp: 0.0,
            label: "N".to_string(),
            confidence: 0.5,
        }])
    }
}

pub struct NullSegmenter;

#[async_trait]
impl Segmenter for NullSegmenter {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn analyze(&self, _audio_bytes: &[u8], duration_seconds: f64) -> Result<Vec<Section>> {
        Ok(vec![Section {
            start: 0.0,
            end: duration_seconds,
            label: "full".to_string(),
            confidence: 1.0,
        }])
    }
}

/// Never finds an external match; the post-extract stage's ASR fallback
/// is what actually produces lyrics in an offline deployment.
pub struct NullLyricsProvider;

#[async_trait]
impl LyricsProvider for NullLyricsProvider {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn lookup(&self, _title: &str, _duration_seconds: f64) -> Result<Option<LyricsDoc>> {
        Ok(None)
    }
}

pub struct NullAsr;

#[async_trait]
impl Asr for NullAsr {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn transcribe(&self, _vocals_audio: &[u8]) -> Result<LyricsDoc> {
        Ok(LyricsDoc::default())
    }
}

pub struct NullVocalOnset;

#[async_trait]
impl VocalOnset for NullVocalOnset {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn refine(&self, _vocals_audio: &[u8], doc: LyricsDoc) -> Result<LyricsDoc> {
        Ok(doc)
    }
}
