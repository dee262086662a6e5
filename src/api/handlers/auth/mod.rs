//! Auth handlers and supporting modules.
//!
//! ## Throttling
//!
//! Every `/v1` request passes the general ceiling (1000 per 15 minutes per
//! client). Login additionally allows 5 failed attempts per 15 minutes and
//! registration 3 attempts per hour. Rejections are `429` with `Retry-After`.
//!
//! ## Forced password change
//!
//! Tokens minted for an account flagged by an administrator reset carry the
//! flag. Until the password is changed such a token is only accepted by
//! `POST /v1/auth/password` and `POST /v1/auth/logout`; everything else
//! answers `403 password_change_required`.

pub(crate) mod admin;
mod errors;
pub(crate) mod login;
pub(crate) mod logout;
pub(crate) mod password;
pub(crate) mod principal;
pub(crate) mod rate_limit;
pub(crate) mod refresh;
pub(crate) mod register;
pub(crate) mod session;
mod state;
pub(crate) mod types;
mod utils;

use axum::response::{IntoResponse, Response};

use crate::session::AuthError;

pub use rate_limit::{
    NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimitPolicy, RateLimiter,
    WindowRateLimiter,
};
pub use state::{AuthConfig, AuthState};

/// Client address resolved once per request by the throttling middleware.
#[derive(Clone, Debug, Default)]
pub struct ClientAddr(pub Option<String>);

fn missing_payload() -> Response {
    AuthError::Validation("missing payload".to_string()).into_response()
}

#[cfg(test)]
mod tests;
