//! `POST /sources/*` — search, fetch, upload, extract and the two
//! single-stage re-run endpoints, plus `GET /users/:id/sources`.

use super::identity::Identity;
use crate::engine::RequestOutcome;
use crate::models::{Role, StemName};
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<SourceSummaryResponse>>> {
    let results = state.engine.search_sources(&query.q).await?;
    Ok(Json(results.into_iter().map(SourceSummaryResponse::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct SourceSummaryResponse {
    pub source_id: String,
    pub title: String,
    pub duration_seconds: f64,
}

impl From<crate::adapters::SourceSummary> for SourceSummaryResponse {
    fn from(s: crate::adapters::SourceSummary) -> Self {
        Self {
            source_id: s.source_id,
            title: s.title,
            duration_seconds: s.duration_seconds,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub source_id: String,
}

/// What every `accepted_job_id | already_done` control-surface operation
/// renders as on the wire.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcceptedResponse {
    Accepted { job_id: uuid::Uuid },
    AlreadyDone { source_id: String },
}

impl From<RequestOutcome> for AcceptedResponse {
    fn from(outcome: RequestOutcome) -> Self {
        match outcome {
            RequestOutcome::Accepted { job_id } => AcceptedResponse::Accepted { job_id },
            RequestOutcome::AlreadyDone { record } => AcceptedResponse::AlreadyDone {
                source_id: record.source_id,
            },
        }
    }
}

pub async fn fetch(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<FetchRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let outcome = state.engine.request_fetch(&identity.user_id, &request.source_id).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

pub async fn upload(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> ApiResult<Json<AcceptedResponse>> {
    let outcome = state
        .engine
        .request_upload(&identity.user_id, &query.filename, body.to_vec())
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub model_id: String,
    #[serde(default)]
    pub stems: Vec<StemName>,
}

pub async fn extract(
    State(state): State<AppState>,
    identity: Identity,
    Path(source_id): Path<String>,
    Json(request): Json<ExtractRequest>,
) -> ApiResult<Json<AcceptedResponse>> {
    let outcome = state
        .engine
        .request_extract(&identity.user_id, &source_id, &request.model_id, request.stems)
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize, Default)]
pub struct RegenerateChordsRequest {
    pub backend: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobIdResponse {
    pub job_id: uuid::Uuid,
}

pub async fn regenerate_chords(
    State(state): State<AppState>,
    identity: Identity,
    Path(source_id): Path<String>,
    Json(request): Json<RegenerateChordsRequest>,
) -> Json<JobIdResponse> {
    let job_id = state
        .engine
        .request_regenerate_chords(&identity.user_id, &source_id, request.backend)
        .await;
    Json(JobIdResponse { job_id })
}

pub async fn generate_lyrics(
    State(state): State<AppState>,
    identity: Identity,
    Path(source_id): Path<String>,
) -> Json<JobIdResponse> {
    let job_id = state.engine.request_generate_lyrics(&identity.user_id, &source_id).await;
    Json(JobIdResponse { job_id })
}

pub async fn list_for_user(
    State(state): State<AppState>,
    identity: Identity,
    Path(path_user_id): Path<String>,
) -> ApiResult<Json<Vec<crate::access::RecordView>>> {
    if path_user_id != identity.user_id && identity.role != crate::models::Role::Admin {
        return Err(ApiError::Forbidden("cannot list another user's sources".to_string()));
    }
    let views = state.engine.list_for_user(&path_user_id, identity.role).await?;
    Ok(Json(views))
}

/// Admin-only cascade delete: removes the record, its blobs, and every
/// access grant that referenced it. Not part of the originally listed
/// control surface but required by §4.1's `delete_record` contract, so it
/// gets an admin-gated route rather than staying unreachable.
pub async fn delete(
    State(state): State<AppState>,
    identity: Identity,
    Path(source_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if identity.role != Role::Admin {
        return Err(ApiError::Forbidden("delete requires admin role".to_string()));
    }
    state.engine.delete_record(&source_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub fn source_routes() -> Router<AppState> {
    Router::new()
        .route("/sources/search", get(search))
        .route("/sources/fetch", post(fetch))
        .route("/sources/upload", post(upload))
        .route("/sources/:id/extract", post(extract))
        .route("/sources/:id/chords/regenerate", post(regenerate_chords))
        .route("/sources/:id/lyrics", post(generate_lyrics))
        .route("/sources/:id", axum::routing::delete(delete))
        .route("/users/:id/sources", get(list_for_user))
}
