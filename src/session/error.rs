//! Error taxonomy shared by the session service and the HTTP layer.

use thiserror::Error;

use super::token::TokenError;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Login failed. Never says whether the identity exists.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Access token past its expiry; the client may refresh and retry.
    #[error("token expired")]
    TokenExpired,
    /// Bad signature, malformed, revoked, or refresh token rejected.
    #[error("invalid token")]
    InvalidToken,
    #[error("password change required")]
    PasswordChangeRequired,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after_seconds}s")]
    Throttled { retry_after_seconds: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine readable code returned to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken => "invalid_token",
            Self::PasswordChangeRequired => "password_change_required",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Throttled { .. } => "rate_limited",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        if err.is_expired() {
            Self::TokenExpired
        } else {
            Self::InvalidToken
        }
    }
}
