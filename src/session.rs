//! Server-side sessions and their cookie.
//!
//! The client holds a random token; only its SHA-256 digest is stored. Every
//! login gets a brand-new session, old ones are never reused or extended.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{Instrument, info_span, instrument};
use uuid::Uuid;

use crate::token::{generate_token, hash_token};

pub const SESSION_COOKIE_NAME: &str = "wikigate_session";
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Longest accepted session lifetime, ten years.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub kb_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("random generator failed: {0}")]
    Random(#[from] rand::Error),
    #[error("session query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("session lifetime out of range: {0}")]
    Lifetime(#[from] chrono::OutOfRangeError),
}

/// Session persistence keyed by token digest.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, token_hash: Vec<u8>, record: SessionRecord) -> Result<(), SessionError>;

    /// Live session for the digest, if any.
    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, SessionError>;

    async fn delete(&self, token_hash: &[u8]) -> Result<(), SessionError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Vec<u8>, SessionRecord>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, token_hash: Vec<u8>, record: SessionRecord) -> Result<(), SessionError> {
        self.sessions.write().await.insert(token_hash, record);
        Ok(())
    }

    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, SessionError> {
        let now = Utc::now();
        Ok(self
            .sessions
            .read()
            .await
            .get(token_hash)
            .filter(|record| record.expires_at > now)
            .cloned())
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<(), SessionError> {
        self.sessions.write().await.remove(token_hash);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete expired sessions. Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64, SessionError> {
        let query = "DELETE FROM sessions WHERE expires_at <= NOW()";
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

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, token_hash: Vec<u8>, record: SessionRecord) -> Result<(), SessionError> {
        let query = r"
            INSERT INTO sessions (id, token_hash, user_id, kb_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.session_id)
            .bind(token_hash)
            .bind(&record.user_id)
            .bind(record.kb_id.as_deref())
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, SessionError> {
        let query = r"
            SELECT id, user_id, kb_id, created_at, expires_at
            FROM sessions
            WHERE token_hash = $1 AND expires_at > NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let Some(row) = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            session_id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kb_id: row.try_get("kb_id")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<(), SessionError> {
        let query = "DELETE FROM sessions WHERE token_hash = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    ttl: Duration,
    secure_cookie: bool,
}

impl SessionConfig {
    /// Default config: 30-day sessions, cookie without `Secure`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            secure_cookie: false,
        }
    }

    /// Lifetimes above [`MAX_SESSION_TTL`] are capped.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.min(MAX_SESSION_TTL);
        self
    }

    #[must_use]
    pub fn with_secure_cookie(mut self, secure: bool) -> Self {
        self.secure_cookie = secure;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn secure_cookie(&self) -> bool {
        self.secure_cookie
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A freshly issued session. `token` goes to the client exactly once.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub record: SessionRecord,
}

/// How the caller presented its session token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credential {
    Bearer,
    Cookie,
}

pub struct SessionIssuer {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIssuer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a new session for `user_id`.
    ///
    /// # Errors
    /// Returns an error if token generation or the store write fails.
    #[instrument(skip(self))]
    pub async fn issue(
        &self,
        user_id: &str,
        kb_id: Option<&str>,
    ) -> Result<IssuedSession, SessionError> {
        let token = generate_token()?;
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl)?;
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kb_id: kb_id.map(str::to_string),
            created_at,
            expires_at: created_at + ttl,
        };
        self.store.insert(hash_token(&token), record.clone()).await?;
        Ok(IssuedSession { token, record })
    }

    /// Resolve a raw token to its live session.
    ///
    /// # Errors
    /// Returns an error if the store lookup fails.
    pub async fn authenticate(&self, token: &str) -> Result<Option<SessionRecord>, SessionError> {
        self.store.lookup(&hash_token(token)).await
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn revoke(&self, token: &str) -> Result<(), SessionError> {
        self.store.delete(&hash_token(token)).await
    }

    /// `Set-Cookie` value carrying `token`.
    ///
    /// # Errors
    /// Returns an error if the token contains bytes not allowed in a header.
    pub fn cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        self.build_cookie(token, self.config.ttl.as_secs())
    }

    /// `Set-Cookie` value that removes the session cookie.
    ///
    /// # Errors
    /// Returns an error if the header cannot be built.
    pub fn clear_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        self.build_cookie("", 0)
    }

    fn build_cookie(&self, token: &str, max_age: u64) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{SESSION_COOKIE_NAME}={token}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax"
        );
        if self.config.secure_cookie {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }
}

/// Pull a session token from `Authorization: Bearer` or the session cookie.
/// The bearer header wins when both are present.
#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<(String, Credential)> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some((token, Credential::Bearer));
    }
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| key.trim() == SESSION_COOKIE_NAME && !value.trim().is_empty())
        .map(|(_, value)| (value.trim().to_string(), Credential::Cookie))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::header::{AUTHORIZATION, COOKIE};

    fn issuer(config: SessionConfig) -> SessionIssuer {
        SessionIssuer::new(Arc::new(MemorySessionStore::new()), config)
    }

    #[tokio::test]
    async fn issue_creates_distinct_sessions() {
        let issuer = issuer(SessionConfig::new());
        let first = issuer.issue("u1", Some("kb1")).await.unwrap();
        let second = issuer.issue("u1", Some("kb1")).await.unwrap();
        assert_ne!(first.token, second.token);
        assert_ne!(first.record.session_id, second.record.session_id);

        let ttl = first.record.expires_at - first.record.created_at;
        assert_eq!(ttl.num_days(), 30);

        let found = issuer.authenticate(&first.token).await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert_eq!(found.kb_id.as_deref(), Some("kb1"));
        assert!(issuer.authenticate(&second.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoked_and_expired_sessions_are_rejected() {
        let issuer = issuer(SessionConfig::new().with_ttl(Duration::from_millis(30)));
        let session = issuer.issue("u1", None).await.unwrap();
        assert!(issuer.authenticate(&session.token).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(issuer.authenticate(&session.token).await.unwrap().is_none());

        let issuer = self::issuer(SessionConfig::new());
        let session = issuer.issue("u1", None).await.unwrap();
        issuer.revoke(&session.token).await.unwrap();
        assert!(issuer.authenticate(&session.token).await.unwrap().is_none());
        assert!(issuer.authenticate("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_lifetime_is_capped() {
        let config = SessionConfig::new().with_ttl(Duration::from_secs(u64::MAX));
        assert_eq!(config.ttl(), MAX_SESSION_TTL);

        let session = issuer(config).issue("u1", None).await.unwrap();
        let ttl = session.record.expires_at - session.record.created_at;
        assert_eq!(ttl.num_days(), 3650);
        assert!(session.record.expires_at > Utc::now());
    }

    #[test]
    fn cookie_attributes() {
        let cookie = issuer(SessionConfig::new()).cookie("abc").unwrap();
        assert_eq!(
            cookie.to_str().unwrap(),
            "wikigate_session=abc; Path=/; Max-Age=2592000; HttpOnly; SameSite=Lax"
        );

        let secure = issuer(SessionConfig::new().with_secure_cookie(true))
            .cookie("abc")
            .unwrap();
        assert!(secure.to_str().unwrap().ends_with("; Secure"));

        let cleared = issuer(SessionConfig::new()).clear_cookie().unwrap();
        assert!(cleared.to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn token_extraction_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; wikigate_session=c"));
        assert_eq!(
            extract_session_token(&headers),
            Some(("c".to_string(), Credential::Cookie))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer b"));
        assert_eq!(
            extract_session_token(&headers),
            Some(("b".to_string(), Credential::Bearer))
        );
    }

    #[test]
    fn empty_credentials_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        headers.insert(COOKIE, HeaderValue::from_static("wikigate_session="));
        assert_eq!(extract_session_token(&headers), None);
        assert_eq!(extract_session_token(&HeaderMap::new()), None);
    }
}
