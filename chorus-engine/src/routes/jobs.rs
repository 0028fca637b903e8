//! `POST /jobs/:id/cancel`

use super::identity::Identity;
use crate::engine::CancelOutcome;
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel(
    State(state): State<AppState>,
    identity: Identity,
    Path(job_id): Path<uuid::Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    match state.engine.cancel(&identity.user_id, job_id).await? {
        CancelOutcome::Cancelled => Ok(Json(CancelResponse { cancelled: true })),
        CancelOutcome::NotOwner => Err(ApiError::Forbidden("not the owner of this job".to_string())),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("no active job {job_id}"))),
    }
}

pub fn job_routes() -> Router<AppState> {
    Router::new().route("/jobs/:id/cancel", post(cancel))
}
