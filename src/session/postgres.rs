//! Postgres implementations of the session stores. Schema lives in `sql/schema.sql`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    credentials::{Account, AccountStore, Identity, InsertOutcome, NewAccount},
    refresh::{ConsumeOutcome, RefreshRecord, RefreshTokenStore},
    revocation::RevocationRegistry,
    role::Role,
};

const ACCOUNT_COLUMNS: &str =
    "id, email, username, password_hash, role, password_change_required, active";

const REFRESH_COLUMNS: &str = "token_hash, subject, family_id, access_jti, access_expires_at, \
                               expires_at, consumed_at, revoked_at";

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: Role::from_db(&role)?,
        password_change_required: row.try_get("password_change_required")?,
        active: row.try_get("active")?,
    })
}

fn refresh_from_row(row: &PgRow) -> Result<RefreshRecord, sqlx::Error> {
    Ok(RefreshRecord {
        token_hash: row.try_get("token_hash")?,
        subject: row.try_get("subject")?,
        family_id: row.try_get("family_id")?,
        access_jti: row.try_get("access_jti")?,
        access_expires_at: row.try_get("access_expires_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

#[derive(Clone, Debug)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_identity(&self, identity: &Identity) -> Result<Option<Account>> {
        let (column, value) = match identity {
            Identity::Email(email) => ("email", email),
            Identity::Username(username) => ("username", username),
        };
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {column} = $1 LIMIT 1");
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup account")?;
        row.as_ref()
            .map(account_from_row)
            .transpose()
            .context("failed to decode account")
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup account by id")?;
        row.as_ref()
            .map(account_from_row)
            .transpose()
            .context("failed to decode account")
    }

    async fn insert(&self, account: NewAccount) -> Result<InsertOutcome> {
        let query = r"
            INSERT INTO accounts (id, email, username, password_hash, role, password_change_required)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id
        ";
        let row = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(&account.email)
            .bind(&account.username)
            .bind(&account.password_hash)
            .bind(account.role.as_str())
            .bind(account.password_change_required)
            .fetch_optional(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert account")?;
        match row {
            Some(row) => Ok(InsertOutcome::Created(row.try_get("id")?)),
            None => Ok(InsertOutcome::Conflict),
        }
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        password_change_required: bool,
    ) -> Result<bool> {
        let query = r"
            UPDATE accounts
            SET password_hash = $2, password_change_required = $3, updated_at = NOW()
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .bind(password_change_required)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update password")?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone, Debug)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn revoke_matching(
        &self,
        column: &'static str,
        value: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshRecord>> {
        let query = format!(
            "UPDATE refresh_tokens SET revoked_at = COALESCE(revoked_at, $2) \
             WHERE {column} = $1 RETURNING {REFRESH_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(value)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .with_context(|| format!("failed to revoke refresh tokens by {column}"))?;
        let mut live = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = refresh_from_row(row)?;
            if record.access_expires_at > now {
                live.push(record);
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        let query = format!(
            "INSERT INTO refresh_tokens ({REFRESH_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        sqlx::query(&query)
            .bind(&record.token_hash)
            .bind(record.subject)
            .bind(record.family_id)
            .bind(record.access_jti)
            .bind(record.access_expires_at)
            .bind(record.expires_at)
            .bind(record.consumed_at)
            .bind(record.revoked_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await
            .context("failed to insert refresh token")?;
        Ok(())
    }

    async fn consume(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<ConsumeOutcome> {
        // Single statement so two concurrent refreshes cannot both win.
        let query = format!(
            "UPDATE refresh_tokens SET consumed_at = $2 \
             WHERE token_hash = $1 AND consumed_at IS NULL AND revoked_at IS NULL \
             AND expires_at > $2 RETURNING {REFRESH_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to consume refresh token")?;
        if let Some(row) = row {
            return Ok(ConsumeOutcome::Consumed(refresh_from_row(&row)?));
        }

        let query = format!("SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup refresh token")?;
        match row.as_ref().map(refresh_from_row).transpose()? {
            Some(record) if record.consumed_at.is_some() => Ok(ConsumeOutcome::Reused(record)),
            _ => Ok(ConsumeOutcome::Rejected),
        }
    }

    async fn revoke(
        &self,
        token_hash: &[u8],
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshRecord>> {
        let query = format!(
            "UPDATE refresh_tokens SET revoked_at = COALESCE(revoked_at, $3) \
             WHERE token_hash = $1 AND subject = $2 RETURNING {REFRESH_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .bind(subject)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to revoke refresh token")?;
        Ok(row.as_ref().map(refresh_from_row).transpose()?)
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshRecord>> {
        self.revoke_matching("family_id", family_id, now).await
    }

    async fn revoke_subject(&self, subject: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshRecord>> {
        self.revoke_matching("subject", subject, now).await
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune refresh tokens")?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone, Debug)]
pub struct PgRevocationRegistry {
    pool: PgPool,
}

impl PgRevocationRegistry {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevocationRegistry for PgRevocationRegistry {
    async fn revoke(&self, jti: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        let query = r"
            INSERT INTO revoked_tokens (jti, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (jti) DO UPDATE
            SET expires_at = GREATEST(revoked_tokens.expires_at, EXCLUDED.expires_at)
        ";
        sqlx::query(query)
            .bind(jti)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to revoke access token")?;
        Ok(())
    }

    async fn is_revoked(&self, jti: Uuid) -> Result<bool> {
        let query =
            "SELECT EXISTS (SELECT 1 FROM revoked_tokens WHERE jti = $1 AND expires_at > NOW())";
        let revoked: bool = sqlx::query_scalar(query)
            .bind(jti)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to check token revocation")?;
        Ok(revoked)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM revoked_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune revoked tokens")?;
        Ok(result.rows_affected())
    }
}
