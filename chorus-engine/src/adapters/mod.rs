//! Analyzer Adapters: capability traits wrapping external backends, §4.7.
//!
//! Each external integration is an `async_trait` object behind `Arc<dyn
//! ...>`, the generalization of the teacher's `Option<Client>` wrapping
//! (`MusicBrainzClient`, `AcoustIDClient`, `EssentiaClient`, each built
//! with `Client::new().ok()` at startup) to a uniform trait so fallback
//! chains can hold heterogeneous concrete adapters.

mod null_adapters;

pub use null_adapters::{
    NullAsr, NullChordAnalyzer, NullLyricsProvider, NullSegmenter, NullSeparator,
    NullSourceFetcher, NullTempoKeyAnalyzer, NullVocalOnset, PassthroughAudioCodec,
};

use crate::models::{ChordEvent, LyricsDoc, Section, StemName};
use async_trait::async_trait;
use chorus_common::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a capability backend can currently serve requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub source_id: String,
    pub title: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub title: String,
    pub duration_seconds: f64,
    pub thumbnail_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub metadata: SourceMetadata,
    pub audio_bytes: Vec<u8>,
    /// File extension of `audio_bytes` as delivered, before any transcode.
    pub ext: String,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn search(&self, query: &str) -> Result<Vec<SourceSummary>>;
    async fn fetch(&self, source_id: &str) -> Result<FetchedSource>;
}

#[async_trait]
pub trait AudioCodec: Send + Sync {
    async fn probe(&self) -> Availability;
    /// Whether `ext` is already the canonical format and needs no
    /// transcoding.
    fn is_canonical(&self, ext: &str) -> bool;
    /// Returns the transcoded bytes plus the canonical extension.
    async fn transcode(&self, bytes: &[u8], source_ext: &str) -> Result<(Vec<u8>, String)>;
}

#[async_trait]
pub trait Separator: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn separate(
        &self,
        audio_bytes: &[u8],
        model_id: &str,
        requested_stems: &[StemName],
    ) -> Result<HashMap<StemName, Vec<u8>>>;
}

#[derive(Debug, Clone)]
pub struct TempoKeyResult {
    pub tempo_bpm: f64,
    pub key: String,
    pub beat_offset_seconds: f64,
    pub confidence: f32,
}

#[async_trait]
pub trait TempoKeyAnalyzer: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn analyze(&self, audio_bytes: &[u8]) -> Result<TempoKeyResult>;
}

#[async_trait]
pub trait ChordAnalyzer: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn probe(&self) -> Availability;
    /// An empty result means "no chords found", which is distinct from
    /// failure and still advances to the next backend in the chain.
    async fn analyze(&self, audio_bytes: &[u8], tempo_hint: Option<f64>) -> Result<Vec<ChordEvent>>;
}

#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn analyze(&self, audio_bytes: &[u8], duration_seconds: f64) -> Result<Vec<Section>>;
}

#[async_trait]
pub trait LyricsProvider: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn lookup(&self, title: &str, duration_seconds: f64) -> Result<Option<LyricsDoc>>;
}

#[async_trait]
pub trait Asr: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn transcribe(&self, vocals_audio: &[u8]) -> Result<LyricsDoc>;
}

#[async_trait]
pub trait VocalOnset: Send + Sync {
    async fn probe(&self) -> Availability;
    async fn refine(&self, vocals_audio: &[u8], doc: LyricsDoc) -> Result<LyricsDoc>;
}

/// Owns one instance of each capability plus the ordered chord fallback
/// chain, built once at `Engine` construction and handed to every
/// `RunnerContext` — never reconstructed per job.
pub struct AdapterRegistry {
    pub source_fetcher: Arc<dyn SourceFetcher>,
    pub audio_codec: Arc<dyn AudioCodec>,
    pub separator: Arc<dyn Separator>,
    pub tempo_key: Arc<dyn TempoKeyAnalyzer>,
    /// Ordered `(backend_name, adapter)`, tried in order until one returns
    /// a non-empty chord list; names match `EngineConfig::chord_backend_order`.
    pub chord_chain: Vec<Arc<dyn ChordAnalyzer>>,
    pub segmenter: Arc<dyn Segmenter>,
    pub lyrics_provider: Arc<dyn LyricsProvider>,
    pub asr: Arc<dyn Asr>,
    pub vocal_onset: Arc<dyn VocalOnset>,
}

impl AdapterRegistry {
    /// Builds a registry of the offline reference adapters, ordered
    /// per `chord_backend_order`. Production deployments construct their
    /// own registry wiring real backends and pass it to `Engine::new`
    /// instead; this constructor exists so the crate's integration tests
    /// and a bare `chorus-engine` binary run end to end without network
    /// access or ML runtimes, the same role the teacher's `hound`-generated
    /// fixtures and `tempfile` dirs play for its import pipeline tests.
    pub fn offline(chord_backend_order: &[String]) -> Self {
        let chord_chain = chord_backend_order
            .iter()
            .map(|name| -> Arc<dyn ChordAnalyzer> { Arc::new(NullChordAnalyzer::named(name)) })
            .collect();

        Self {
            source_fetcher: Arc::new(NullSourceFetcher),
            audio_codec: Arc::new(PassthroughAudioCodec),
            separator: Arc::new(NullSeparator),
            tempo_key: Arc::new(NullTempoKeyAnalyzer),
            chord_chain,
            segmenter: Arc::new(NullSegmenter),
            lyrics_provider: Arc::new(NullLyricsProvider),
            asr: Arc::new(NullAsr),
            vocal_onset: Arc::new(NullVocalOnset),
        }
    }

    /// Runs the chord fallback chain, returning the first non-empty
    /// result plus the name of the backend that produced it. Unavailable
    /// backends are skipped without being called, per §4.7 (probe then
    /// dispatch).
    pub async fn resolve_chords(
        &self,
        audio_bytes: &[u8],
        tempo_hint: Option<f64>,
    ) -> Result<Option<(String, Vec<ChordEvent>)>> {
        self.resolve_chords_with_override(audio_bytes, tempo_hint, None).await
    }

    /// Same fallback chain, except when `backend_override` names a specific
    /// backend: that one is tried alone, bypassing the chain, so a
    /// `regenerate_chords(backend)` request actually runs the requested
    /// backend rather than silently falling back to whichever one ran first.
    pub async fn resolve_chords_with_override(
        &self,
        audio_bytes: &[u8],
        tempo_hint: Option<f64>,
        backend_override: Option<&str>,
    ) -> Result<Option<(String, Vec<ChordEvent>)>> {
        if let Some(name) = backend_override {
            let Some(backend) = self.chord_chain.iter().find(|b| b.backend_name() == name) else {
                return Ok(None);
            };
            if !backend.probe().await.is_available() {
                return Ok(None);
            }
            let events = backend.analyze(audio_bytes, tempo_hint).await?;
            return Ok(Some((backend.backend_name().to_string(), events)));
        }

        for backend in &self.chord_chain {
            if !backend.probe().await.is_available() {
                continue;
            }
            let events = backend.analyze(audio_bytes, tempo_hint).await?;
            if !events.is_empty() {
                return Ok(Some((backend.backend_name().to_string(), events)));
            }
        }
        Ok(None)
    }
}
