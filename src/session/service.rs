//! Credential lifecycle: login, registration, rotation, revocation and
//! password changes.

use argon2::Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    credentials::{
        AccountStore, CredentialValidator, InsertOutcome, NewAccount, check_password_policy,
        valid_email, valid_username,
    },
    error::AuthError,
    issuer::{IssuedTokens, TokenIssuer},
    refresh::{ConsumeOutcome, RefreshRecord, RefreshTokenStore, hash_refresh_token},
    revocation::RevocationRegistry,
    role::{Capability, Role},
    token::AccessClaims,
};

#[derive(Clone, Debug)]
pub struct Registration {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// What an authenticated caller learns about its own session.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct SessionView {
    pub subject: Uuid,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub password_change_required: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub revocations: u64,
    pub refresh_tokens: u64,
}

pub struct SessionService {
    accounts: Arc<dyn AccountStore>,
    credentials: CredentialValidator,
    issuer: TokenIssuer,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    revocations: Arc<dyn RevocationRegistry>,
}

impl SessionService {
    #[must_use]
    pub fn new(
        issuer: TokenIssuer,
        accounts: Arc<dyn AccountStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        revocations: Arc<dyn RevocationRegistry>,
    ) -> Self {
        Self {
            credentials: CredentialValidator::new(accounts.clone()),
            accounts,
            issuer,
            refresh_tokens,
            revocations,
        }
    }

    /// Override the Argon2 cost used for new password hashes.
    #[must_use]
    pub fn with_hash_params(mut self, params: Params) -> Self {
        self.credentials = CredentialValidator::with_params(self.accounts.clone(), params);
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialValidator {
        &self.credentials
    }

    #[must_use]
    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Exchange credentials for a fresh token pair in a new family.
    ///
    /// # Errors
    /// `InvalidCredentials` for any credential failure, `Internal` on storage errors.
    #[instrument(skip_all)]
    pub async fn login(&self, identifier: &str, password: &str) -> Result<IssuedTokens, AuthError> {
        let account = self.credentials.validate(identifier, password).await?;
        let pair = self.issuer.mint(&account, Uuid::new_v4(), Utc::now())?;
        self.refresh_tokens.insert(pair.record).await?;
        info!(subject = %account.id, role = %account.role, "login succeeded");
        Ok(pair.tokens)
    }

    /// Create a student account.
    ///
    /// # Errors
    /// `Validation` for malformed input, `Conflict` when email or username is taken.
    #[instrument(skip_all)]
    pub async fn register(&self, registration: Registration) -> Result<Uuid, AuthError> {
        let email = registration.email.trim().to_lowercase();
        let username = registration.username.trim().to_lowercase();
        if !valid_email(&email) {
            return Err(AuthError::Validation("invalid email".to_string()));
        }
        if !valid_username(&username) {
            return Err(AuthError::Validation(
                "username must be 3-64 characters of a-z, 0-9, '.', '_' or '-'".to_string(),
            ));
        }
        check_password_policy(&registration.password)?;

        let password_hash = self.credentials.hash_password(&registration.password)?;
        let outcome = self
            .accounts
            .insert(NewAccount {
                email,
                username,
                password_hash,
                role: Role::Student,
                password_change_required: false,
            })
            .await?;

        match outcome {
            InsertOutcome::Created(id) => {
                info!(subject = %id, "account registered");
                Ok(id)
            }
            InsertOutcome::Conflict => Err(AuthError::Conflict(
                "email or username already registered".to_string(),
            )),
        }
    }

    /// Rotate a refresh token.
    ///
    /// Presenting an already consumed token revokes its entire family.
    ///
    /// # Errors
    /// `InvalidToken` for unknown, expired, revoked or replayed tokens.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, AuthError> {
        let now = Utc::now();
        let token_hash = hash_refresh_token(refresh_token);
        match self.refresh_tokens.consume(&token_hash, now).await? {
            ConsumeOutcome::Consumed(record) => {
                let account = self.accounts.find_by_id(record.subject).await?;
                let Some(account) = account.filter(|account| account.active) else {
                    self.revoke_family(record.family_id, now).await?;
                    return Err(AuthError::InvalidToken);
                };
                let pair = self.issuer.mint(&account, record.family_id, now)?;
                self.refresh_tokens.insert(pair.record).await?;
                Ok(pair.tokens)
            }
            ConsumeOutcome::Reused(record) => {
                warn!(
                    subject = %record.subject,
                    family = %record.family_id,
                    "refresh token reuse detected, revoking family"
                );
                self.revoke_family(record.family_id, now).await?;
                Err(AuthError::InvalidToken)
            }
            ConsumeOutcome::Rejected => Err(AuthError::InvalidToken),
        }
    }

    /// Verify an access token and check it against the revocation registry.
    ///
    /// # Errors
    /// `TokenExpired` when only the expiry failed, `InvalidToken` otherwise.
    pub async fn authorize(&self, access_token: &str) -> Result<AccessClaims, AuthError> {
        let claims = self.issuer.verify(access_token, Utc::now())?;
        if self.revocations.is_revoked(claims.jti).await? {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    #[instrument(skip_all, fields(subject = %claims.sub))]
    pub async fn session(&self, claims: &AccessClaims) -> Result<SessionView, AuthError> {
        let account = self
            .accounts
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        Ok(SessionView {
            subject: account.id,
            email: account.email,
            username: account.username,
            role: account.role,
            password_change_required: account.password_change_required,
            expires_at: claims.expires_at(),
        })
    }

    /// Revoke the presented access token and, when given, the caller's refresh token.
    ///
    /// # Errors
    /// `Internal` on storage errors.
    #[instrument(skip_all, fields(subject = %claims.sub))]
    pub async fn logout(
        &self,
        claims: &AccessClaims,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        self.revocations
            .revoke(claims.jti, claims.expires_at())
            .await?;
        if let Some(refresh_token) = refresh_token {
            let token_hash = hash_refresh_token(refresh_token);
            let revoked = self
                .refresh_tokens
                .revoke(&token_hash, claims.sub, Utc::now())
                .await?;
            if revoked.is_none() {
                warn!("logout presented a refresh token that does not belong to the caller");
            }
        }
        info!("logged out");
        Ok(())
    }

    /// Change the caller's own password and end every other session.
    ///
    /// # Errors
    /// `Validation` when the current password is wrong or the new one fails policy.
    #[instrument(skip_all, fields(subject = %claims.sub))]
    pub async fn change_password(
        &self,
        claims: &AccessClaims,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let account = self
            .accounts
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !self
            .credentials
            .verify_password(current_password, &account.password_hash)
        {
            return Err(AuthError::Validation(
                "current password is incorrect".to_string(),
            ));
        }
        check_password_policy(new_password)?;
        if new_password == current_password {
            return Err(AuthError::Validation(
                "new password must differ from the current one".to_string(),
            ));
        }

        let password_hash = self.credentials.hash_password(new_password)?;
        self.accounts
            .update_password(account.id, &password_hash, false)
            .await?;

        let now = Utc::now();
        self.revocations
            .revoke(claims.jti, claims.expires_at())
            .await?;
        let revoked = self.revoke_subject(account.id, now).await?;
        info!(revoked_access_tokens = revoked, "password changed");
        Ok(())
    }

    /// Set a temporary password on another account and force a change at next login.
    ///
    /// # Errors
    /// `Forbidden` unless the actor may reset credentials, `NotFound` for unknown targets.
    #[instrument(skip_all, fields(actor = %actor.sub, target = %target))]
    pub async fn reset_password(
        &self,
        actor: &AccessClaims,
        target: Uuid,
        temporary_password: &str,
    ) -> Result<(), AuthError> {
        if !actor.role.can(Capability::ResetCredentials) {
            return Err(AuthError::Forbidden);
        }
        check_password_policy(temporary_password)?;

        let password_hash = self.credentials.hash_password(temporary_password)?;
        if !self
            .accounts
            .update_password(target, &password_hash, true)
            .await?
        {
            return Err(AuthError::NotFound);
        }

        let revoked = self.revoke_subject(target, Utc::now()).await?;
        info!(revoked_access_tokens = revoked, "password reset by administrator");
        Ok(())
    }

    /// Revoke every refresh token of `subject` and blacklist the access tokens
    /// paired with them. Returns the number of access tokens blacklisted.
    ///
    /// # Errors
    /// `Internal` on storage errors.
    pub async fn revoke_subject(&self, subject: Uuid, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let records = self.refresh_tokens.revoke_subject(subject, now).await?;
        self.blacklist_paired(&records).await
    }

    async fn revoke_family(&self, family_id: Uuid, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let records = self.refresh_tokens.revoke_family(family_id, now).await?;
        self.blacklist_paired(&records).await
    }

    async fn blacklist_paired(&self, records: &[RefreshRecord]) -> Result<usize, AuthError> {
        for record in records {
            self.revocations
                .revoke(record.access_jti, record.access_expires_at)
                .await?;
        }
        Ok(records.len())
    }

    /// Remove expired revocation entries and refresh records.
    ///
    /// # Errors
    /// `Internal` on storage errors.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<PruneReport, AuthError> {
        Ok(PruneReport {
            revocations: self.revocations.prune_expired(now).await?,
            refresh_tokens: self.refresh_tokens.prune_expired(now).await?,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{memory_service, seed_account};
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn login_then_authorize() -> Result<()> {
        let service = memory_service()?;
        let id = seed_account(&service, "ana", "password-1", Role::Student).await?;

        let tokens = service.login("ana", "password-1").await?;
        let claims = service.authorize(&tokens.access_token).await?;
        assert_eq!(claims.sub, id);
        assert_eq!(claims.role, Role::Student);
        assert!(!tokens.password_change_required);
        Ok(())
    }

    #[tokio::test]
    async fn register_normalizes_and_rejects_duplicates() -> Result<()> {
        let service = memory_service()?;
        let registration = Registration {
            email: " Ana@Uni.EDU".to_string(),
            username: "Ana.Perez".to_string(),
            password: "long-enough".to_string(),
        };
        service.register(registration.clone()).await?;
        let tokens = service.login("ana.perez", "long-enough").await?;
        let claims = service.authorize(&tokens.access_token).await?;
        assert_eq!(claims.role, Role::Student);

        let duplicate = service.register(registration).await;
        assert!(matches!(duplicate, Err(AuthError::Conflict(_))));

        let weak = service
            .register(Registration {
                email: "b@uni.edu".to_string(),
                username: "bee".to_string(),
                password: "short".to_string(),
            })
            .await;
        assert!(matches!(weak, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_rotates_and_replay_revokes_family() -> Result<()> {
        let service = memory_service()?;
        seed_account(&service, "ana", "password-1", Role::Student).await?;
        let first = service.login("ana", "password-1").await?;

        let second = service.refresh(&first.refresh_token).await?;
        assert_ne!(second.refresh_token, first.refresh_token);
        service.authorize(&second.access_token).await?;

        // Replaying the consumed token kills the family, including the newest pair.
        let replay = service.refresh(&first.refresh_token).await;
        assert!(matches!(replay, Err(AuthError::InvalidToken)));
        let stale = service.authorize(&second.access_token).await;
        assert!(matches!(stale, Err(AuthError::InvalidToken)));
        let successor = service.refresh(&second.refresh_token).await;
        assert!(matches!(successor, Err(AuthError::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_refresh_token_is_invalid() -> Result<()> {
        let service = memory_service()?;
        let result = service.refresh("not-a-real-token").await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn logout_revokes_access_and_refresh() -> Result<()> {
        let service = memory_service()?;
        seed_account(&service, "ana", "password-1", Role::Student).await?;
        let tokens = service.login("ana", "password-1").await?;
        let claims = service.authorize(&tokens.access_token).await?;

        service
            .logout(&claims, Some(&tokens.refresh_token))
            .await?;
        assert!(matches!(
            service.authorize(&tokens.access_token).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            service.refresh(&tokens.refresh_token).await,
            Err(AuthError::InvalidToken)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn change_password_ends_all_sessions() -> Result<()> {
        let service = memory_service()?;
        seed_account(&service, "ana", "password-1", Role::Student).await?;
        let laptop = service.login("ana", "password-1").await?;
        let phone = service.login("ana", "password-1").await?;
        let claims = service.authorize(&laptop.access_token).await?;

        let wrong = service
            .change_password(&claims, "not-it", "password-2")
            .await;
        assert!(matches!(wrong, Err(AuthError::Validation(_))));

        service
            .change_password(&claims, "password-1", "password-2")
            .await?;
        for tokens in [&laptop, &phone] {
            assert!(service.authorize(&tokens.access_token).await.is_err());
            assert!(service.refresh(&tokens.refresh_token).await.is_err());
        }
        assert!(service.login("ana", "password-1").await.is_err());
        service.login("ana", "password-2").await?;
        Ok(())
    }

    #[tokio::test]
    async fn admin_reset_forces_change_and_revokes() -> Result<()> {
        let service = memory_service()?;
        let admin = seed_account(&service, "root", "admin-pass", Role::Admin).await?;
        let student = seed_account(&service, "ana", "password-1", Role::Student).await?;
        let admin_tokens = service.login("root", "admin-pass").await?;
        let admin_claims = service.authorize(&admin_tokens.access_token).await?;
        assert_eq!(admin_claims.sub, admin);
        let student_tokens = service.login("ana", "password-1").await?;
        let student_claims = service.authorize(&student_tokens.access_token).await?;

        let denied = service
            .reset_password(&student_claims, admin, "temporary-1")
            .await;
        assert!(matches!(denied, Err(AuthError::Forbidden)));

        let missing = service
            .reset_password(&admin_claims, Uuid::new_v4(), "temporary-1")
            .await;
        assert!(matches!(missing, Err(AuthError::NotFound)));

        service
            .reset_password(&admin_claims, student, "temporary-1")
            .await?;
        assert!(service.authorize(&student_tokens.access_token).await.is_err());

        let forced = service.login("ana", "temporary-1").await?;
        assert!(forced.password_change_required);
        let forced_claims = service.authorize(&forced.access_token).await?;
        assert!(forced_claims.pcr);

        service
            .change_password(&forced_claims, "temporary-1", "brand-new-pass")
            .await?;
        let after = service.login("ana", "brand-new-pass").await?;
        assert!(!after.password_change_required);
        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_nothing_live() -> Result<()> {
        let service = memory_service()?;
        seed_account(&service, "ana", "password-1", Role::Student).await?;
        let tokens = service.login("ana", "password-1").await?;
        let claims = service.authorize(&tokens.access_token).await?;
        service.logout(&claims, None).await?;

        let report = service.prune_expired(Utc::now()).await?;
        assert_eq!(report, PruneReport::default());
        assert!(service.authorize(&tokens.access_token).await.is_err());
        Ok(())
    }
}
