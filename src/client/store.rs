//! Client-side session persistence.
//!
//! Tokens, the decoded profile and the forced-change flag are saved and cleared
//! together so a reader never sees a half-updated session.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::warn;
use uuid::Uuid;

use super::errors::SessionError;
use crate::session::{IssuedTokens, Role, TokenError, token::decode_unverified};

/// Claims cached from the access token for display and routing decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionProfile {
    pub subject: Uuid,
    pub role: Role,
    pub password_change_required: bool,
    /// Access token expiry, unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub profile: SessionProfile,
}

impl StoredSession {
    /// Build the persisted session from a token response.
    ///
    /// # Errors
    /// Returns an error if the access token payload cannot be decoded.
    pub fn from_tokens(tokens: &IssuedTokens) -> Result<Self, TokenError> {
        let claims = decode_unverified(&tokens.access_token)?;
        Ok(Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            profile: SessionProfile {
                subject: claims.sub,
                role: claims.role,
                password_change_required: claims.pcr || tokens.password_change_required,
                expires_at: claims.exp,
            },
        })
    }
}

pub trait SessionStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn load(&self) -> Result<Option<StoredSession>, SessionError>;

    /// Replace the stored session.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn save(&self, session: StoredSession) -> Result<(), SessionError>;

    /// Remove every stored field. Clearing an empty store is not an error.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn clear(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<StoredSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(session: StoredSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<StoredSession>, SessionError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, session: StoredSession) -> Result<(), SessionError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// JSON file backend. Writes go to a sibling temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn store_error(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Store(format!("{context}: {err}"))
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<StoredSession>, SessionError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(store_error("failed to read session file", err)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(path = %self.path.display(), "discarding unreadable session file: {err}");
                self.clear()?;
                Ok(None)
            }
        }
    }

    fn save(&self, session: StoredSession) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec_pretty(&session)
            .map_err(|err| store_error("failed to encode session", err))?;
        let temp = self.temp_path();
        fs::write(&temp, bytes).map_err(|err| store_error("failed to write session file", err))?;
        fs::rename(&temp, &self.path)
            .map_err(|err| store_error("failed to replace session file", err))
    }

    fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(store_error("failed to remove session file", err)),
        }
    }
}
