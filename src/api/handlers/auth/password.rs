//! Self-service password change.
//!
//! This is the one protected action allowed while the forced-change flag is
//! set. Success revokes every token of the account, including the caller's.

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
    types::{ChangePasswordRequest, ErrorResponse},
};

#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 204, description = "Password changed, all sessions revoked"),
        (status = 400, description = "Wrong current password or weak new password", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn change_password(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ChangePasswordRequest>>,
) -> Response {
    let claims = match require_auth(&headers, &auth_state).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return super::missing_payload();
    };

    match auth_state
        .service()
        .change_password(&claims, &request.current_password, &request.new_password)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
