//! HTTP mapping for [`AuthError`].
//!
//! Clients key off the `error` code: `token_expired` is the only 401 worth a
//! refresh, every other 401 ends the session.

use axum::{
    Json,
    http::{
        HeaderValue, StatusCode,
        header::{RETRY_AFTER, WWW_AUTHENTICATE},
    },
    response::{IntoResponse, Response},
};
use tracing::error;

use super::types::ErrorResponse;
use crate::session::AuthError;

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::TokenExpired | Self::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::PasswordChangeRequired | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Self::Throttled {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };
        let message = match &self {
            Self::Internal(err) => {
                error!("auth request failed: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = match self {
                Self::InvalidCredentials => HeaderValue::from_static("Bearer"),
                Self::TokenExpired => HeaderValue::from_static(
                    "Bearer error=\"invalid_token\", error_description=\"token expired\"",
                ),
                _ => HeaderValue::from_static("Bearer error=\"invalid_token\""),
            };
            headers.insert(WWW_AUTHENTICATE, challenge);
        }
        if let Some(seconds) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(response: Response) -> anyhow::Result<ErrorResponse> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn expired_token_is_distinguishable() -> anyhow::Result<()> {
        let response = AuthError::TokenExpired.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));
        let body = body_of(response).await?;
        assert_eq!(body.error, "token_expired");
        Ok(())
    }

    #[tokio::test]
    async fn throttled_carries_retry_after() -> anyhow::Result<()> {
        let response = AuthError::Throttled {
            retry_after_seconds: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("42")
        );
        let body = body_of(response).await?;
        assert_eq!(body.error, "rate_limited");
        assert_eq!(body.retry_after, Some(42));
        Ok(())
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() -> anyhow::Result<()> {
        let response = AuthError::Internal(anyhow::anyhow!("db password is hunter2")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await?;
        assert_eq!(body.message, "internal server error");
        Ok(())
    }

    #[test]
    fn forced_change_is_forbidden() {
        assert_eq!(
            AuthError::PasswordChangeRequired.status(),
            StatusCode::FORBIDDEN
        );
    }
}
