//! Authenticated principal extraction and the forced password change gate.
//!
//! Flow Overview: read the bearer token, verify it and check the revocation
//! registry, then (for everything except logout and password change) refuse
//! callers whose token still carries the password-change flag.

use axum::http::HeaderMap;

use super::{state::AuthState, utils::extract_bearer_token};
use crate::session::{AccessClaims, AuthError, Capability};

/// Resolve the bearer token into verified claims.
///
/// # Errors
/// `InvalidToken` when the header is missing, `TokenExpired` or `InvalidToken`
/// from verification.
pub async fn require_auth(headers: &HeaderMap, state: &AuthState) -> Result<AccessClaims, AuthError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::InvalidToken)?;
    state.service().authorize(&token).await
}

/// [`require_auth`] plus the forced password change gate.
///
/// # Errors
/// Same as [`require_auth`], and `PasswordChangeRequired` for flagged tokens.
pub async fn require_active(
    headers: &HeaderMap,
    state: &AuthState,
) -> Result<AccessClaims, AuthError> {
    let claims = require_auth(headers, state).await?;
    if claims.pcr {
        return Err(AuthError::PasswordChangeRequired);
    }
    Ok(claims)
}

/// Refuse callers whose role lacks `capability`.
///
/// # Errors
/// `Forbidden` when the role check fails.
pub fn require_capability(claims: &AccessClaims, capability: Capability) -> Result<(), AuthError> {
    if claims.role.can(capability) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}
