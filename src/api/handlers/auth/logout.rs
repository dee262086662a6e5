//! Logout revokes the presented access token and optionally a refresh token.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::{
    principal::require_auth,
    state::AuthState,
    types::{ErrorResponse, LogoutRequest},
};

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Tokens revoked"),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LogoutRequest>>,
) -> Response {
    // Reachable while a password change is pending.
    let claims = match require_auth(&headers, &auth_state).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    match auth_state
        .service()
        .logout(&claims, request.refresh_token.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
