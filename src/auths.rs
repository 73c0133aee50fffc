//! Wiki reader identities created by OAuth logins.
//!
//! One record per (knowledge base, provider subject). Auth group `auth_ids`
//! refer to these ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{Instrument, info_span};

use crate::oauth::ExternalIdentity;

pub const SOURCE_OAUTH: &str = "oauth";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    pub id: i64,
    pub kb_id: String,
    pub source_type: String,
    pub subject: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub ip: Option<String>,
    pub last_login_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait AuthRepository: Send + Sync {
    /// Create or refresh the record for an OAuth login and stamp the login
    /// time and source IP.
    async fn record_login(
        &self,
        kb_id: &str,
        identity: &ExternalIdentity,
        ip: Option<&str>,
    ) -> Result<AuthRecord, AuthError>;

    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthRecord>, AuthError>;

    /// Remove a record of the given knowledge base. Returns `false` when no
    /// such record exists there.
    async fn delete(&self, kb_id: &str, id: i64) -> Result<bool, AuthError>;
}

#[derive(Debug, Default)]
struct Auths {
    next_id: i64,
    by_id: BTreeMap<i64, AuthRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryAuthRepository {
    auths: RwLock<Auths>,
}

impl MemoryAuthRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthRepository for MemoryAuthRepository {
    async fn record_login(
        &self,
        kb_id: &str,
        identity: &ExternalIdentity,
        ip: Option<&str>,
    ) -> Result<AuthRecord, AuthError> {
        let mut auths = self.auths.write().await;
        let now = Utc::now();
        if let Some(existing) = auths.by_id.values_mut().find(|auth| {
            auth.kb_id == kb_id && auth.source_type == SOURCE_OAUTH && auth.subject == identity.subject
        }) {
            existing.username.clone_from(&identity.username);
            existing.avatar_url.clone_from(&identity.avatar_url);
            existing.ip = ip.map(str::to_string);
            existing.last_login_at = now;
            return Ok(existing.clone());
        }

        auths.next_id += 1;
        let record = AuthRecord {
            id: auths.next_id,
            kb_id: kb_id.to_string(),
            source_type: SOURCE_OAUTH.to_string(),
            subject: identity.subject.clone(),
            username: identity.username.clone(),
            avatar_url: identity.avatar_url.clone(),
            ip: ip.map(str::to_string),
            last_login_at: now,
            created_at: now,
        };
        auths.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthRecord>, AuthError> {
        Ok(self
            .auths
            .read()
            .await
            .by_id
            .values()
            .filter(|auth| auth.kb_id == kb_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, kb_id: &str, id: i64) -> Result<bool, AuthError> {
        let mut auths = self.auths.write().await;
        if !auths.by_id.get(&id).is_some_and(|auth| auth.kb_id == kb_id) {
            return Ok(false);
        }
        auths.by_id.remove(&id);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct PgAuthRepository {
    pool: PgPool,
}

impl PgAuthRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn auth_from_row(row: &PgRow) -> Result<AuthRecord, sqlx::Error> {
    Ok(AuthRecord {
        id: row.try_get("id")?,
        kb_id: row.try_get("kb_id")?,
        source_type: row.try_get("source_type")?,
        subject: row.try_get("subject")?,
        username: row.try_get("username")?,
        avatar_url: row.try_get("avatar_url")?,
        ip: row.try_get("ip")?,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AuthRepository for PgAuthRepository {
    async fn record_login(
        &self,
        kb_id: &str,
        identity: &ExternalIdentity,
        ip: Option<&str>,
    ) -> Result<AuthRecord, AuthError> {
        let query = r"
            INSERT INTO auths (kb_id, source_type, subject, username, avatar_url, ip, last_login_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (kb_id, source_type, subject) DO UPDATE SET
                username = EXCLUDED.username,
                avatar_url = EXCLUDED.avatar_url,
                ip = EXCLUDED.ip,
                last_login_at = NOW()
            RETURNING id, kb_id, source_type, subject, username, avatar_url, ip,
                last_login_at, created_at
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(kb_id)
            .bind(SOURCE_OAUTH)
            .bind(&identity.subject)
            .bind(identity.username.as_deref())
            .bind(identity.avatar_url.as_deref())
            .bind(ip)
            .fetch_one(&self.pool)
            .instrument(span)
            .await?;
        Ok(auth_from_row(&row)?)
    }

    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthRecord>, AuthError> {
        let query = r"
            SELECT id, kb_id, source_type, subject, username, avatar_url, ip,
                last_login_at, created_at
            FROM auths
            WHERE kb_id = $1
            ORDER BY id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(kb_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter()
            .map(auth_from_row)
            .collect::<Result<_, _>>()
            .map_err(AuthError::from)
    }

    async fn delete(&self, kb_id: &str, id: i64) -> Result<bool, AuthError> {
        let query = "DELETE FROM auths WHERE kb_id = $1 AND id = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(kb_id)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity(subject: &str, username: &str) -> ExternalIdentity {
        ExternalIdentity {
            subject: subject.to_string(),
            username: Some(username.to_string()),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn repeated_login_reuses_record() {
        let repo = MemoryAuthRepository::new();
        let first = repo
            .record_login("kb1", &identity("42", "jane"), Some("10.0.0.1"))
            .await
            .unwrap();
        let second = repo
            .record_login("kb1", &identity("42", "jane.doe"), Some("10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("jane.doe"));
        assert_eq!(second.ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(repo.list_by_kb("kb1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_subject_in_other_kb_is_distinct() {
        let repo = MemoryAuthRepository::new();
        let a = repo
            .record_login("kb1", &identity("42", "jane"), None)
            .await
            .unwrap();
        let b = repo
            .record_login("kb2", &identity("42", "jane"), None)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.source_type, SOURCE_OAUTH);
    }

    #[tokio::test]
    async fn delete_is_scoped_to_the_knowledge_base() {
        let repo = MemoryAuthRepository::new();
        let record = repo
            .record_login("kb1", &identity("42", "jane"), None)
            .await
            .unwrap();
        assert!(!repo.delete("kb2", record.id).await.unwrap());
        assert!(repo.delete("kb1", record.id).await.unwrap());
        assert!(!repo.delete("kb1", record.id).await.unwrap());
        assert!(repo.list_by_kb("kb1").await.unwrap().is_empty());
    }
}
