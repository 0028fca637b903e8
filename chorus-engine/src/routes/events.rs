//! `GET /users/:id/events` — a Progress Bus room as an SSE stream.

use super::identity::Identity;
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use chorus_common::sse::progress_event_stream;

pub async fn user_events(
    State(state): State<AppState>,
    identity: Identity,
    Path(path_user_id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    if path_user_id != identity.user_id && identity.role != crate::models::Role::Admin {
        return Err(ApiError::Forbidden("cannot watch another user's events".to_string()));
    }
    let (backlog, rx) = state.engine.subscribe(&path_user_id).await;
    Ok(progress_event_stream(backlog, rx))
}

pub fn event_routes() -> Router<AppState> {
    Router::new().route("/users/:id/events", get(user_events))
}
