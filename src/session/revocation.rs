//! Revocation registry for access token identifiers.
//!
//! An entry only needs to live until the token it names would have expired on
//! its own; after that the signature check rejects the token anyway.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait RevocationRegistry: Send + Sync {
    /// Record `jti` as revoked until `expires_at`. Repeated calls keep the later expiry.
    async fn revoke(&self, jti: Uuid, expires_at: DateTime<Utc>) -> Result<()>;
    /// True while a non-expired entry exists for `jti`.
    async fn is_revoked(&self, jti: Uuid) -> Result<bool>;
    /// Drop entries whose expiry is at or before `now`. Returns how many were removed.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryRevocationRegistry {
    entries: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl MemoryRevocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RevocationRegistry for MemoryRevocationRegistry {
    async fn revoke(&self, jti: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(jti)
            .and_modify(|current| {
                if expires_at > *current {
                    *current = expires_at;
                }
            })
            .or_insert(expires_at);
        Ok(())
    }

    async fn is_revoked(&self, jti: Uuid) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .entries
            .read()
            .await
            .get(&jti)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}
