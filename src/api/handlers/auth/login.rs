//! Credential login.

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
    types::{ErrorResponse, LoginRequest},
};
use crate::session::{AuthError, IssuedTokens};

/// Exchange credentials for an access/refresh token pair.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = IssuedTokens),
        (status = 400, description = "Missing payload", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many failed attempts", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    auth_state: Extension<Arc<AuthState>>,
    Extension(ClientAddr(client_ip)): Extension<ClientAddr>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return super::missing_payload();
    };

    // The slot is reserved on admission so concurrent attempts cannot overrun
    // the ceiling. Only invalid credentials keep it.
    let ip = client_ip.as_deref();
    if let Err(err) = enforce(auth_state.rate_limiter(), ip, RateLimitAction::Login) {
        return err.into_response();
    }

    let outcome = auth_state
        .service()
        .login(&request.identifier, &request.password)
        .await;
    if !matches!(outcome, Err(AuthError::InvalidCredentials)) {
        auth_state.rate_limiter().release(ip, RateLimitAction::Login);
    }
    match outcome {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(err) => err.into_response(),
    }
}
