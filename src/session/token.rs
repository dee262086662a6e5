//! HS256 access tokens.
//!
//! Tokens are compact JWTs: `base64url(header).base64url(claims).base64url(mac)`.
//! The server verifies signature, issuer and expiry; clients may only peek at the
//! payload with [`decode_unverified`] to decide on redirects.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use super::role::Role;

type HmacSha256 = Hmac<Sha256>;

const ALG_HS256: &str = "HS256";
const TYP_JWT: &str = "JWT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenHeader {
    pub alg: String,
    pub typ: String,
}

impl AccessTokenHeader {
    fn hs256() -> Self {
        Self {
            alg: ALG_HS256.to_string(),
            typ: TYP_JWT.to_string(),
        }
    }
}

/// Claims carried by every access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
    /// Password change required before any other protected action.
    #[serde(default)]
    pub pcr: bool,
}

impl AccessClaims {
    /// Expiry is exclusive: a token whose `exp` equals `now` is already expired.
    #[must_use]
    pub const fn is_expired_at(&self, now_unix_seconds: i64) -> bool {
        self.exp <= now_unix_seconds
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("token expired")]
    Expired,
}

impl TokenError {
    /// Only expiry is recoverable (by refreshing); everything else is fatal.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn mac(secret: &[u8], signing_input: &str) -> Result<Vec<u8>, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Split a compact token into its three segments.
fn split(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.trim().split('.');
    let header = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims = parts.next().ok_or(TokenError::TokenFormat)?;
    let signature = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() || header.is_empty() || claims.is_empty() {
        return Err(TokenError::TokenFormat);
    }
    Ok((header, claims, signature))
}

/// Create an HS256 signed access token.
///
/// # Errors
///
/// Returns an error if the key is unusable or the claims cannot be encoded.
pub fn sign_hs256(secret: &[u8], claims: &AccessClaims) -> Result<String, TokenError> {
    let header_b64 = b64e_json(&AccessTokenHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = mac(secret, &signing_input)?;
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify an HS256 access token and return its claims.
///
/// # Errors
///
/// Returns an error if:
/// - the token is malformed or contains invalid base64/json,
/// - the algorithm is not HS256 or the signature does not match,
/// - the issuer differs from `expected_issuer`,
/// - `exp` is at or before `now_unix_seconds`.
pub fn verify_hs256(
    token: &str,
    secret: &[u8],
    expected_issuer: &str,
    now_unix_seconds: i64,
) -> Result<AccessClaims, TokenError> {
    let (header_b64, claims_b64, sig_b64) = split(token)?;

    let header: AccessTokenHeader = b64d_json(header_b64)?;
    if header.alg != ALG_HS256 {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let provided = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let expected = mac(secret, &format!("{header_b64}.{claims_b64}"))?;
    if provided.ct_eq(expected.as_slice()).unwrap_u8() != 1 {
        return Err(TokenError::InvalidSignature);
    }

    let claims: AccessClaims = b64d_json(claims_b64)?;
    if claims.iss != expected_issuer {
        return Err(TokenError::InvalidIssuer);
    }
    if claims.is_expired_at(now_unix_seconds) {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

/// Decode the claims without checking the signature or expiry.
///
/// Never use the result for an authorization decision.
///
/// # Errors
///
/// Returns an error if the token is not a decodable compact token.
pub fn decode_unverified(token: &str) -> Result<AccessClaims, TokenError> {
    let (_, claims_b64, _) = split(token)?;
    b64d_json(claims_b64)
}
