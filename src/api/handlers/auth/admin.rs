//! Administrative credential reset.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    principal::{require_active, require_capability},
    state::AuthState,
    types::{ErrorResponse, PasswordResetRequest},
};
use crate::session::Capability;

/// Set a temporary password; the account must change it at next login.
#[utoipa::path(
    post,
    path = "/v1/admin/accounts/{id}/password-reset",
    params(("id" = Uuid, Path, description = "Account id")),
    request_body = PasswordResetRequest,
    responses(
        (status = 204, description = "Temporary password set, sessions revoked"),
        (status = 400, description = "Temporary password fails policy", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 403, description = "Caller may not reset credentials", body = ErrorResponse),
        (status = 404, description = "Unknown account", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn reset_password(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<PasswordResetRequest>>,
) -> Response {
    let claims = match require_active(&headers, &auth_state).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_capability(&claims, Capability::ResetCredentials) {
        return err.into_response();
    }
    let Some(Json(request)) = payload else {
        return super::missing_payload();
    };

    match auth_state
        .service()
        .reset_password(&claims, id, &request.temporary_password)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}
