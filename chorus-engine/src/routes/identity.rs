//! Request identity extraction.
//!
//! Per §6.1's Non-goals note, authentication itself is out of scope: the
//! caller (a session middleware upstream) is trusted to have already
//! resolved who is making the request and to forward it as headers. This
//! extractor only reads that already-authenticated context; it never
//! validates credentials.

use crate::models::Role;
use crate::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

/// The authenticated caller of a request, forwarded by the session
/// middleware that sits in front of this service.
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or((StatusCode::UNAUTHORIZED, "missing x-user-id header"))?;

        let role = match parts.headers.get(ROLE_HEADER).and_then(|v| v.to_str().ok()) {
            Some("admin") => Role::Admin,
            _ => Role::User,
        };

        Ok(Identity { user_id, role })
    }
}
