//! Student self-registration.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::{
    ClientAddr,
    rate_limit::{RateLimitAction, enforce},
    state::AuthState,
    types::{ErrorResponse, RegisterRequest, RegisterResponse},
};
use crate::session::Registration;

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = RegisterResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Email or username already registered", body = ErrorResponse),
        (status = 429, description = "Too many registrations", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn register(
    auth_state: Extension<Arc<AuthState>>,
    Extension(ClientAddr(client_ip)): Extension<ClientAddr>,
    payload: Option<Json<RegisterRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return super::missing_payload();
    };

    if let Err(err) = enforce(
        auth_state.rate_limiter(),
        client_ip.as_deref(),
        RateLimitAction::Register,
    ) {
        return err.into_response();
    }

    let registration = Registration {
        email: request.email,
        username: request.username,
        password: request.password,
    };
    match auth_state.service().register(registration).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(RegisterResponse { id: id.to_string() }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}
