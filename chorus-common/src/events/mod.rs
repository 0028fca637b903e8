//! Progress Bus: typed pub/sub fan-out of job events, §4.6.
//!
//! Generalizes the single process-wide broadcast channel the teacher uses
//! (`wkmp_common::events::EventBus`, one `tokio::sync::broadcast` for the
//! whole process) into one channel per room, where a room is either
//! `user:<user_id>` or `global`. Rooms are created lazily on first
//! subscribe and their per-job terminal events are replayed to subscribers
//! that attach after the event fired, per §4.6's delivery semantics.

mod payload;

pub use payload::{ArtifactSummary, ProgressEventBody, Stage};

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// The room a [`ProgressEvent`] is published into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    User(String),
    Global,
}

impl RoomId {
    pub fn user(user_id: impl Into<String>) -> Self {
        RoomId::User(user_id.into())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomId::User(id) => write!(f, "user:{}", id),
            RoomId::Global => f.write_str("global"),
        }
    }
}

/// One event on the Progress Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Absent only for `GlobalArtifactReady`, which has no owning job.
    pub job_id: Option<Uuid>,
    pub source_id: String,
    pub user_id: Option<String>,
    pub stage: Option<Stage>,
    pub body: ProgressEventBody,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProgressEvent {
    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.body.is_terminal()
    }

    pub fn failed(
        job_id: Uuid,
        source_id: impl Into<String>,
        user_id: Option<String>,
        stage: Stage,
        error: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            source_id: source_id.into(),
            user_id,
            stage: Some(stage),
            body: ProgressEventBody::Failed {
                error_kind: error,
                message: message.into(),
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

struct RoomState {
    tx: broadcast::Sender<ProgressEvent>,
    /// Last terminal event per job, so a late subscriber (one that attaches
    /// after the terminal event already fired) still observes it, per the
    /// "no persistence beyond in-memory buffers" + "never drop terminal
    /// events" pairing in §4.6.
    last_terminal: HashMap<Uuid, ProgressEvent>,
}

/// Typed pub/sub fan-out, one broadcast channel per room.
///
/// # Examples
///
/// ```
/// use chorus_common::events::{ProgressBus, RoomId};
///
/// let bus = ProgressBus::new(1000);
/// let _rx = bus.subscribe(&RoomId::Global);
/// ```
#[derive(Clone)]
pub struct ProgressBus {
    rooms: Arc<RwLock<HashMap<RoomId, RoomState>>>,
    capacity: usize,
}

impl ProgressBus {
    /// `capacity` bounds each room's broadcast buffer. Recommended values
    /// mirror the teacher's guidance for its single global bus: 1000 for a
    /// desktop-scale deployment, smaller for constrained hosts, 10-100 for
    /// tests.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribe to a room, creating it if this is the first subscriber.
    /// Events published before subscription are not received; callers that
    /// need the terminal-event replay guarantee should use
    /// [`subscribe_with_backlog`](Self::subscribe_with_backlog) instead.
    pub async fn subscribe(&self, room: &RoomId) -> broadcast::Receiver<ProgressEvent> {
        self.subscribe_with_backlog(room).await.1
    }

    /// Same as [`subscribe`](Self::subscribe), but also hands back every
    /// terminal event currently buffered for the room, so a transport layer
    /// can replay them to a subscriber that attaches after the event fired
    /// — the "never drop terminal events" half of §4.6. The snapshot is
    /// taken and the receiver created under the same write lock, so no
    /// terminal event published between the two can be missed or doubled.
    pub async fn subscribe_with_backlog(
        &self,
        room: &RoomId,
    ) -> (Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room.clone()).or_insert_with(|| RoomState {
            tx: broadcast::channel(self.capacity).0,
            last_terminal: HashMap::new(),
        });
        let backlog = state.last_terminal.values().cloned().collect();
        (backlog, state.tx.subscribe())
    }

    /// Publish `event` into `room`. Best-effort: if nobody is listening
    /// the event is simply dropped, matching the teacher's `emit_lossy`.
    pub async fn publish(&self, room: RoomId, event: ProgressEvent) {
        let mut rooms = self.rooms.write().await;
        let state = rooms.entry(room).or_insert_with(|| RoomState {
            tx: broadcast::channel(self.capacity).0,
            last_terminal: HashMap::new(),
        });

        if event.is_terminal() {
            if let Some(job_id) = event.job_id {
                state.last_terminal.insert(job_id, event.clone());
            }
        }

        let _ = state.tx.send(event);
    }

    /// Publish to the user's room and, for events relevant process-wide
    /// (`GlobalArtifactReady`), also to the global room.
    pub async fn publish_to_user(&self, user_id: impl Into<String>, event: ProgressEvent) {
        self.publish(RoomId::user(user_id), event).await;
    }

    pub async fn publish_global(&self, event: ProgressEvent) {
        self.publish(RoomId::Global, event).await;
    }

    /// Fan out the same event to every grantee's room, used when a job
    /// completes and the Access View has a list of entitled users (§4.3).
    pub async fn publish_to_users(&self, user_ids: &[String], event: ProgressEvent) {
        for user_id in user_ids {
            self.publish(RoomId::user(user_id.clone()), event.clone())
                .await;
        }
    }

    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|s| s.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(job_id: Uuid) -> ProgressEvent {
        ProgressEvent {
            job_id: Some(job_id),
            source_id: "xA1B2c".to_string(),
            user_id: Some("u_alice".to_string()),
            stage: Some(Stage::Fetch),
            body: ProgressEventBody::Started,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_of_different_rooms_are_isolated() {
        let bus = ProgressBus::new(10);
        let mut alice_rx = bus.subscribe(&RoomId::user("u_alice")).await;
        let mut bob_rx = bus.subscribe(&RoomId::user("u_bob")).await;

        bus.publish_to_user("u_alice", sample_event(Uuid::new_v4()))
            .await;

        assert!(alice_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscriber_replays_terminal_event() {
        let bus = ProgressBus::new(10);
        let job_id = Uuid::new_v4();
        let terminal = ProgressEvent {
            body: ProgressEventBody::Completed {
                artifact_summary: ArtifactSummary {
                    source_id: "xA1B2c".to_string(),
                    title: None,
                    has_stems: true,
                    has_chords: false,
                    has_structure: false,
                    has_lyrics: false,
                },
            },
            ..sample_event(job_id)
        };
        bus.publish_to_user("u_alice", terminal).await;

        // A subscriber attaching after the terminal event still observes
        // it via the room's replay buffer rather than the live channel.
        let rooms = bus.rooms.read().await;
        let state = rooms.get(&RoomId::user("u_alice")).unwrap();
        assert!(state.last_terminal.contains_key(&job_id));
    }

    #[tokio::test]
    async fn late_subscriber_receives_backlog_over_the_channel() {
        let bus = ProgressBus::new(10);
        let job_id = Uuid::new_v4();
        let terminal = ProgressEvent {
            body: ProgressEventBody::Completed {
                artifact_summary: ArtifactSummary {
                    source_id: "xA1B2c".to_string(),
                    title: None,
                    has_stems: true,
                    has_chords: false,
                    has_structure: false,
                    has_lyrics: false,
                },
            },
            ..sample_event(job_id)
        };
        bus.publish_to_user("u_alice", terminal).await;

        let (backlog, mut rx) = bus.subscribe_with_backlog(&RoomId::user("u_alice")).await;
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].job_id, Some(job_id));

        // The live channel carries nothing further until a new event fires.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_room_is_independent_of_user_rooms() {
        let bus = ProgressBus::new(10);
        let mut global_rx = bus.subscribe(&RoomId::Global).await;
        bus.publish_global(ProgressEvent {
            job_id: None,
            source_id: "xA1B2c".to_string(),
            user_id: None,
            stage: None,
            body: ProgressEventBody::GlobalArtifactReady {
                source_id: "xA1B2c".to_string(),
            },
            timestamp: chrono::Utc::now(),
        })
        .await;

        let received = global_rx.try_recv().unwrap();
        assert_eq!(received.event_type(), "GlobalArtifactReady");
    }
}
