//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE transport adapter for the Progress Bus.

use crate::events::ProgressEvent;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Create a simple heartbeat-only SSE stream for connection status
/// monitoring. Used by endpoints that need connection status UI but have
/// no domain events to broadcast (e.g. before a subscription target
/// exists).
pub fn create_heartbeat_sse_stream(
    service_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} general events", service_name);

    let stream = async_stream::stream! {
        info!("SSE: {} event stream started", service_name);

        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            tokio::time::sleep(Duration::from_secs(15)).await;
            debug!("SSE: Sending heartbeat");
            yield Ok(Event::default().comment("heartbeat"));
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// Wrap a Progress Bus room subscription in an SSE stream, serializing
/// each [`ProgressEvent`] as the event payload. A lagged receiver (the
/// subscriber fell behind and the broadcast buffer wrapped) is reported
/// once via a comment frame and the stream continues — per §4.6,
/// intermediate `Progress` events may be dropped under backpressure, but
/// the connection itself is never torn down for it.
///
/// `backlog` is replayed before the live stream, so a subscriber that
/// attaches after a job's terminal event fired still observes it — see
/// [`crate::events::ProgressBus::subscribe_with_backlog`].
pub fn progress_event_stream(
    backlog: Vec<ProgressEvent>,
    mut rx: broadcast::Receiver<ProgressEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        for event in backlog {
            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                Err(e) => warn!(error = %e, "failed to serialize backlog progress event"),
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                        Err(e) => warn!(error = %e, "failed to serialize progress event"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged, intermediate events dropped");
                    yield Ok(Event::default().comment("lagged"));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
