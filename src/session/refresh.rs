//! Refresh tokens: opaque random values, stored only as SHA-256 hashes.
//!
//! Each refresh token belongs to a family that starts at login. Every refresh
//! consumes the presented token and issues a successor in the same family. A
//! consumed token coming back means it leaked, and the whole family is revoked.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub token_hash: Vec<u8>,
    pub subject: Uuid,
    pub family_id: Uuid,
    /// `jti` of the access token minted together with this refresh token.
    pub access_jti: Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshRecord {
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && self.revoked_at.is_none() && self.expires_at > now
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Token was live and is now consumed.
    Consumed(RefreshRecord),
    /// Token had already been consumed: replay.
    Reused(RefreshRecord),
    /// Unknown, expired or revoked.
    Rejected,
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: RefreshRecord) -> Result<()>;
    /// Atomically mark a live token consumed.
    async fn consume(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<ConsumeOutcome>;
    /// Revoke one token if it belongs to `subject`. Returns the record when revoked.
    async fn revoke(
        &self,
        token_hash: &[u8],
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>>;
    /// Revoke every token in a family. Returns all family records whose paired
    /// access token has not yet expired.
    async fn revoke_family(&self, family_id: Uuid, now: DateTime<Utc>)
    -> Result<Vec<RefreshRecord>>;
    /// Revoke every token of a subject, with the same return contract as
    /// [`RefreshTokenStore::revoke_family`].
    async fn revoke_subject(&self, subject: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshRecord>>;
    /// Delete records whose refresh expiry has passed.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Create a new refresh token. Only the hash is persisted.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_refresh_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[must_use]
pub fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    records: Mutex<HashMap<Vec<u8>, RefreshRecord>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn revoke_where<F>(
        records: &mut HashMap<Vec<u8>, RefreshRecord>,
        now: DateTime<Utc>,
        predicate: F,
    ) -> Vec<RefreshRecord>
    where
        F: Fn(&RefreshRecord) -> bool,
    {
        let mut affected = Vec::new();
        for record in records.values_mut().filter(|record| predicate(record)) {
            if record.revoked_at.is_none() {
                record.revoked_at = Some(now);
            }
            if record.access_expires_at > now {
                affected.push(record.clone());
            }
        }
        affected
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<ConsumeOutcome> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(token_hash) else {
            return Ok(ConsumeOutcome::Rejected);
        };
        if record.consumed_at.is_some() {
            return Ok(ConsumeOutcome::Reused(record.clone()));
        }
        if !record.usable_at(now) {
            return Ok(ConsumeOutcome::Rejected);
        }
        record.consumed_at = Some(now);
        Ok(ConsumeOutcome::Consumed(record.clone()))
    }

    async fn revoke(
        &self,
        token_hash: &[u8],
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>> {
        let mut records = self.records.lock().await;
        match records.get_mut(token_hash) {
            Some(record) if record.subject == subject => {
                if record.revoked_at.is_none() {
                    record.revoked_at = Some(now);
                }
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshRecord>> {
        let mut records = self.records.lock().await;
        Ok(Self::revoke_where(&mut records, now, |record| {
            record.family_id == family_id
        }))
    }

    async fn revoke_subject(&self, subject: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshRecord>> {
        let mut records = self.records.lock().await;
        Ok(Self::revoke_where(&mut records, now, |record| {
            record.subject == subject
        }))
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}
