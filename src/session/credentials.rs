//! Account lookup and password verification.
//!
//! An identity is either an email (contains `@`) or a username. Unknown
//! identities still pay for one Argon2id verification so response timing does
//! not reveal which accounts exist.

use anyhow::{Result, anyhow};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use regex::Regex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{error::AuthError, role::Role};

pub const PASSWORD_MIN_LEN: usize = 8;
pub const PASSWORD_MAX_LEN: usize = 128;

const DUMMY_PASSWORD: &str = "tesis-dummy-password-for-timing";

/// Login identity as typed by the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Email(String),
    Username(String),
}

impl Identity {
    /// Normalize and classify a raw identifier.
    ///
    /// # Errors
    /// Returns `Validation` when the value is neither a plausible email nor a username.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.contains('@') {
            if valid_email(&normalized) {
                return Ok(Self::Email(normalized));
            }
            return Err(AuthError::Validation("invalid email".to_string()));
        }
        if valid_username(&normalized) {
            Ok(Self::Username(normalized))
        } else {
            Err(AuthError::Validation("invalid username".to_string()))
        }
    }
}

pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub(crate) fn valid_username(username_normalized: &str) -> bool {
    Regex::new(r"^[a-z0-9._-]{3,64}$").is_ok_and(|regex| regex.is_match(username_normalized))
}

/// Password length policy, counted in characters.
///
/// # Errors
/// Returns `Validation` when the password is too short or too long.
pub fn check_password_policy(password: &str) -> Result<(), AuthError> {
    let len = password.chars().count();
    if len < PASSWORD_MIN_LEN {
        return Err(AuthError::Validation(format!(
            "password must be at least {PASSWORD_MIN_LEN} characters"
        )));
    }
    if len > PASSWORD_MAX_LEN {
        return Err(AuthError::Validation(format!(
            "password must be at most {PASSWORD_MAX_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub password_change_required: bool,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub password_change_required: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(Uuid),
    Conflict,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_identity(&self, identity: &Identity) -> Result<Option<Account>>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>>;
    /// Insert a new account; email and username are unique.
    async fn insert(&self, account: NewAccount) -> Result<InsertOutcome>;
    /// Replace the password hash and forced-change flag. Returns false for unknown ids.
    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        password_change_required: bool,
    ) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<Uuid, Account>>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_identity(&self, identity: &Identity) -> Result<Option<Account>> {
        let accounts = self.accounts.read().await;
        let found = accounts.values().find(|account| match identity {
            Identity::Email(email) => account.email == *email,
            Identity::Username(username) => account.username == *username,
        });
        Ok(found.cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn insert(&self, account: NewAccount) -> Result<InsertOutcome> {
        let mut accounts = self.accounts.write().await;
        if accounts
            .values()
            .any(|existing| existing.email == account.email || existing.username == account.username)
        {
            return Ok(InsertOutcome::Conflict);
        }
        let id = Uuid::new_v4();
        accounts.insert(
            id,
            Account {
                id,
                email: account.email,
                username: account.username,
                password_hash: account.password_hash,
                role: account.role,
                password_change_required: account.password_change_required,
                active: true,
            },
        );
        Ok(InsertOutcome::Created(id))
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        password_change_required: bool,
    ) -> Result<bool> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(false);
        };
        account.password_hash = password_hash.to_string();
        account.password_change_required = password_change_required;
        Ok(true)
    }
}

/// Argon2id hashing plus the identity lookup that backs login.
pub struct CredentialValidator {
    accounts: Arc<dyn AccountStore>,
    params: Params,
    dummy_hash: Option<String>,
}

impl CredentialValidator {
    #[must_use]
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self::with_params(accounts, Params::default())
    }

    /// Use explicit Argon2 cost parameters for new hashes.
    #[must_use]
    pub fn with_params(accounts: Arc<dyn AccountStore>, params: Params) -> Self {
        let mut validator = Self {
            accounts,
            params,
            dummy_hash: None,
        };
        validator.dummy_hash = validator.hash_password(DUMMY_PASSWORD).ok();
        validator
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password into a PHC string.
    ///
    /// # Errors
    /// Returns an error if Argon2 rejects the input.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| anyhow!("failed to hash password"))?
            .to_string();
        Ok(hash)
    }

    /// Verify a password against a stored PHC string. Malformed hashes never match.
    #[must_use]
    pub fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return false;
        };
        self.argon2()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Resolve an identity and check its password.
    ///
    /// Every failure, including unknown or disabled accounts, is reported as
    /// `InvalidCredentials`.
    ///
    /// # Errors
    /// Returns `InvalidCredentials`, or `Internal` when storage fails.
    pub async fn validate(&self, identifier: &str, password: &str) -> Result<Account, AuthError> {
        let Ok(identity) = Identity::parse(identifier) else {
            self.burn_dummy(password);
            return Err(AuthError::InvalidCredentials);
        };

        let Some(account) = self.accounts.find_by_identity(&identity).await? else {
            debug!("login for unknown identity");
            self.burn_dummy(password);
            return Err(AuthError::InvalidCredentials);
        };

        let matches = self.verify_password(password, &account.password_hash);
        if !matches || !account.active {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(account)
    }

    fn burn_dummy(&self, password: &str) {
        if let Some(hash) = &self.dummy_hash {
            let _ = self.verify_password(password, hash);
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_params() -> Params {
    Params::new(8, 1, 1, None).unwrap_or_default()
}
