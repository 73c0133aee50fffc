//! `kv_entries` backed store.
//!
//! Each operation is one SQL statement; Postgres row locking on the primary
//! key makes the upserts atomic across replicas.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{Instrument, info_span};

use super::{KeyedStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete expired rows. Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let query = "DELETE FROM kv_entries WHERE expires_at <= NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected())
    }
}

fn ttl_seconds(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

#[async_trait]
impl KeyedStore for PgStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let query = r"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, '1', NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN kv_entries.expires_at <= NOW() THEN '1'
                    ELSE (kv_entries.value::bigint + 1)::text
                END,
                expires_at = EXCLUDED.expires_at
            RETURNING value
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .bind(ttl_seconds(ttl))
            .fetch_one(&self.pool)
            .instrument(span)
            .await?;
        let value: String = row.try_get("value")?;
        value.parse::<i64>().map_err(|_| StoreError::NotANumber {
            key: key.to_string(),
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // The conditional update only fires for an expired row, so a live entry
        // makes RETURNING yield nothing.
        let query = r"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at <= NOW()
            RETURNING key
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl_seconds(ttl))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl_seconds(ttl))
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let query = "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let query = r"
            DELETE FROM kv_entries
            WHERE key = $1
            RETURNING value, expires_at > NOW() AS live
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let live: bool = row.try_get("live")?;
        if !live {
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let query = "DELETE FROM kv_entries WHERE key = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(key)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }
}
