//! Refresh token rotation.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::{
    state::AuthState,
    types::{ErrorResponse, RefreshRequest},
};
use crate::session::IssuedTokens;

/// Consume a refresh token and issue a new pair. Reusing a consumed token
/// revokes every token descended from the same login.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated", body = IssuedTokens),
        (status = 400, description = "Missing payload", body = ErrorResponse),
        (status = 401, description = "Refresh token invalid, expired, revoked or reused", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh(
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return super::missing_payload();
    };
    match auth_state.service().refresh(&request.refresh_token).await {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(err) => err.into_response(),
    }
}
