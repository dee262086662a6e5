//! Current session introspection.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::{principal::require_active, state::AuthState, types::ErrorResponse};
use crate::session::SessionView;

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionView),
        (status = 401, description = "Missing, expired or revoked token", body = ErrorResponse),
        (status = 403, description = "Password change required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, auth_state: Extension<Arc<AuthState>>) -> Response {
    let claims = match require_active(&headers, &auth_state).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    match auth_state.service().session(&claims).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}
