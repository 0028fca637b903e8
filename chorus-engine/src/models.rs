//! Domain data model: `ArtifactRecord` and everything it embeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type SourceId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// One separated instrumental component. The set is fixed per `model_id`:
/// the base four plus `guitar`/`piano` when a six-stem model produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StemName {
    Vocals,
    Drums,
    Bass,
    Other,
    Guitar,
    Piano,
}

impl StemName {
    pub fn as_str(self) -> &'static str {
        match self {
            StemName::Vocals => "vocals",
            StemName::Drums => "drums",
            StemName::Bass => "bass",
            StemName::Other => "other",
            StemName::Guitar => "guitar",
            StemName::Piano => "piano",
        }
    }

    pub fn for_model(model_id: &str) -> Vec<StemName> {
        if model_id.starts_with("six_stem") {
            vec![
                StemName::Vocals,
                StemName::Drums,
                StemName::Bass,
                StemName::Other,
                StemName::Guitar,
                StemName::Piano,
            ]
        } else {
            vec![
                StemName::Vocals,
                StemName::Drums,
                StemName::Bass,
                StemName::Other,
            ]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    pub timestamp: f64,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub start: f64,
    pub end: f64,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricsWord {
    pub start: f64,
    pub end: f64,
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricsLine {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub words: Vec<LyricsWord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyricsDoc {
    pub lines: Vec<LyricsLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordsSource {
    Primary,
    Fallback,
    Hybrid,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LyricsSource {
    ExternalApi,
    Asr,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub tempo_bpm: Option<f64>,
    pub key: Option<String>,
    pub analysis_confidence: Option<f32>,
    pub beat_offset_seconds: f64,
    pub chords: Option<Vec<ChordEvent>>,
    pub chords_source: Option<ChordsSource>,
    pub structure: Option<Vec<Section>>,
    pub lyrics: Option<LyricsDoc>,
    pub lyrics_source: Option<LyricsSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionState {
    None,
    Claimed,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub state: Option<ExtractionState>,
    pub model_id: Option<String>,
    pub stem_refs: Option<HashMap<StemName, crate::store::BlobRef>>,
    pub silent_stems: Vec<StemName>,
    pub archive_ref: Option<crate::store::BlobRef>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Extraction {
    pub fn state_or_none(&self) -> ExtractionState {
        self.state.unwrap_or(ExtractionState::None)
    }
}

/// The canonical per-source record, owned exclusively by the Artifact Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub source_id: SourceId,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
    pub thumbnail_ref: Option<String>,
    pub audio_blob_ref: Option<crate::store::BlobRef>,
    pub analysis: Analysis,
    pub extraction: Extraction,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: None,
            duration_seconds: None,
            thumbnail_ref: None,
            audio_blob_ref: None,
            analysis: Analysis::default(),
            extraction: Extraction::default(),
            created_at: Utc::now(),
        }
    }
}

/// A partial update applied to an [`ArtifactRecord`] by `upsert_record`.
/// Only `Some` fields are written; absent fields leave the stored value
/// untouched, satisfying the "other fields preserved" guarantee in §4.1.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPatch {
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
    pub thumbnail_ref: Option<String>,
    pub audio_blob_ref: Option<crate::store::BlobRef>,
    pub analysis: Option<Analysis>,
    pub extraction: Option<Extraction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub user_id: UserId,
    pub source_id: SourceId,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub job_id: uuid::Uuid,
    pub source_id: SourceId,
    pub stage: chorus_common::Stage,
    pub outcome: JobState,
    pub error_kind: Option<chorus_common::ErrorKind>,
    pub brief_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
