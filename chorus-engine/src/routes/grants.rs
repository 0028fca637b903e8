//! `POST /users/:id/grants/:source_id`, `DELETE /users/:id/grants/:source_id`
//!
//! Grant/revoke is admin-only: the caller in `path_user_id` is the grantee,
//! never the actor, so this never lets a user grant themselves access.

use super::identity::Identity;
use crate::models::Role;
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub granted: bool,
}

fn require_admin(identity: &Identity) -> ApiResult<()> {
    if identity.role != Role::Admin {
        return Err(ApiError::Forbidden("grants require admin role".to_string()));
    }
    Ok(())
}

pub async fn grant(
    State(state): State<AppState>,
    identity: Identity,
    Path((user_id, source_id)): Path<(String, String)>,
) -> ApiResult<Json<GrantResponse>> {
    require_admin(&identity)?;
    state.engine.grant(&user_id, &source_id).await?;
    Ok(Json(GrantResponse { granted: true }))
}

pub async fn revoke(
    State(state): State<AppState>,
    identity: Identity,
    Path((user_id, source_id)): Path<(String, String)>,
) -> ApiResult<Json<GrantResponse>> {
    require_admin(&identity)?;
    state.engine.revoke(&user_id, &source_id).await?;
    Ok(Json(GrantResponse { granted: false }))
}

pub fn grant_routes() -> Router<AppState> {
    Router::new().route(
        "/users/:id/grants/:source_id",
        post(grant).delete(revoke),
    )
}
