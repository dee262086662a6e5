//! Minting and verifying token pairs.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    credentials::Account,
    error::AuthError,
    refresh::{RefreshRecord, generate_refresh_token, hash_refresh_token},
    token::{AccessClaims, TokenError, sign_hs256, verify_hs256},
};

pub const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_TOKEN_ISSUER: &str = "tesis";
pub const MIN_SECRET_LEN: usize = 32;

/// Token pair returned by login and refresh.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// The account must change its password before anything else.
    pub password_change_required: bool,
}

/// Output of [`TokenIssuer::mint`]: the wire pair plus what must be persisted.
#[derive(Debug)]
pub struct MintedPair {
    pub tokens: IssuedTokens,
    pub claims: AccessClaims,
    pub record: RefreshRecord,
}

pub struct TokenIssuer {
    secret: SecretString,
    issuer: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// # Errors
    /// Returns an error if the signing secret is shorter than 32 bytes.
    pub fn new(secret: SecretString, issuer: String) -> anyhow::Result<Self> {
        if secret.expose_secret().len() < MIN_SECRET_LEN {
            anyhow::bail!("token secret must be at least {MIN_SECRET_LEN} bytes");
        }
        Ok(Self {
            secret,
            issuer,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
        })
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    /// Mint an access token and a refresh token in `family_id`.
    ///
    /// # Errors
    /// Returns `Internal` if signing or random generation fails.
    pub fn mint(
        &self,
        account: &Account,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MintedPair, AuthError> {
        let iat = now.timestamp();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: account.id,
            role: account.role,
            iat,
            exp: iat + self.access_ttl_seconds,
            jti: Uuid::new_v4(),
            pcr: account.password_change_required,
        };
        let access_token = sign_hs256(self.secret.expose_secret().as_bytes(), &claims)
            .context("failed to sign access token")?;
        let refresh_token = generate_refresh_token()?;

        let record = RefreshRecord {
            token_hash: hash_refresh_token(&refresh_token),
            subject: account.id,
            family_id,
            access_jti: claims.jti,
            access_expires_at: claims.expires_at(),
            expires_at: now + Duration::seconds(self.refresh_ttl_seconds),
            consumed_at: None,
            revoked_at: None,
        };

        Ok(MintedPair {
            tokens: IssuedTokens {
                access_token,
                refresh_token,
                token_type: "Bearer".to_string(),
                expires_in: self.access_ttl_seconds,
                password_change_required: account.password_change_required,
            },
            claims,
            record,
        })
    }

    /// Verify signature, issuer and expiry.
    ///
    /// # Errors
    /// Returns the underlying [`TokenError`].
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        verify_hs256(
            token,
            self.secret.expose_secret().as_bytes(),
            &self.issuer,
            now.timestamp(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::role::Role;

    fn issuer() -> anyhow::Result<TokenIssuer> {
        TokenIssuer::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            "tesis-test".to_string(),
        )
    }

    fn account(forced: bool) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: "ana@uni.edu".to_string(),
            username: "ana".to_string(),
            password_hash: String::new(),
            role: Role::Advisor,
            password_change_required: forced,
            active: true,
        }
    }

    #[test]
    fn short_secret_is_rejected() {
        let result = TokenIssuer::new(SecretString::from("short".to_string()), "x".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn mint_pairs_access_and_refresh() -> anyhow::Result<()> {
        let issuer = issuer()?;
        let account = account(true);
        let family = Uuid::new_v4();
        let now = Utc::now();
        let pair = issuer.mint(&account, family, now)?;

        assert_eq!(pair.claims.sub, account.id);
        assert_eq!(pair.claims.role, Role::Advisor);
        assert!(pair.claims.pcr);
        assert!(pair.tokens.password_change_required);
        assert_eq!(pair.claims.exp - pair.claims.iat, DEFAULT_ACCESS_TTL_SECONDS);
        assert_eq!(pair.record.access_jti, pair.claims.jti);
        assert_eq!(pair.record.family_id, family);
        assert_eq!(
            pair.record.token_hash,
            hash_refresh_token(&pair.tokens.refresh_token)
        );

        let verified = issuer.verify(&pair.tokens.access_token, now)?;
        assert_eq!(verified, pair.claims);
        Ok(())
    }

    #[test]
    fn verify_reports_expiry() -> anyhow::Result<()> {
        let issuer = issuer()?.with_access_ttl_seconds(60);
        let now = Utc::now();
        let pair = issuer.mint(&account(false), Uuid::new_v4(), now)?;
        let result = issuer.verify(&pair.tokens.access_token, now + Duration::seconds(60));
        assert!(matches!(result, Err(TokenError::Expired)));
        Ok(())
    }
}
