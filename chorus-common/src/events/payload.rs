//! Payload types carried by [`super::ProgressEvent`]

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Stage identifiers, shared by the Job Queue, Stage Runners and the wire
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Analyze,
    Extract,
    PostExtract,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Analyze => "analyze",
            Stage::Extract => "extract",
            Stage::PostExtract => "post_extract",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compact view of an `ArtifactRecord`, sized for the wire rather than
/// for storage — full records are fetched via the control surface's
/// `list_for_user`, not reconstructed from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub source_id: String,
    pub title: Option<String>,
    pub has_stems: bool,
    pub has_chords: bool,
    pub has_structure: bool,
    pub has_lyrics: bool,
}

/// The typed body of a [`super::ProgressEvent`], per §4.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventBody {
    Enqueued,
    Started,
    Progress {
        phase: String,
        percent: u8,
        detail: Option<String>,
    },
    Completed {
        artifact_summary: ArtifactSummary,
    },
    Failed {
        error_kind: ErrorKind,
        message: String,
    },
    Cancelled,
    /// Global-room-only: a source's artifacts changed, no particular job
    /// attached.
    GlobalArtifactReady {
        source_id: String,
    },
}

impl ProgressEventBody {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEventBody::Enqueued => "Enqueued",
            ProgressEventBody::Started => "Started",
            ProgressEventBody::Progress { .. } => "Progress",
            ProgressEventBody::Completed { .. } => "Completed",
            ProgressEventBody::Failed { .. } => "Failed",
            ProgressEventBody::Cancelled => "Cancelled",
            ProgressEventBody::GlobalArtifactReady { .. } => "GlobalArtifactReady",
        }
    }

    /// Terminal events are guaranteed exactly-once delivery to every
    /// currently-attached, entitled subscriber (§6) and are never dropped
    /// under backpressure (§4.6).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEventBody::Completed { .. }
                | ProgressEventBody::Failed { .. }
                | ProgressEventBody::Cancelled
        )
    }
}
