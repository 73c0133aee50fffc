//! Knowledge base (tenant) settings consulted by the OAuth flow.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, types::Json};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{Instrument, info_span};

/// Where a tenant's wiki is served. A non-empty `base_url` pins redirects to
/// its host; otherwise `hosts` is the allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSettings {
    pub base_url: Option<String>,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scopes: Vec<String>,
    /// Our callback endpoint registered with the provider.
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: String,
    pub access: AccessSettings,
    pub oauth: Option<OAuthClientConfig>,
}

impl KnowledgeBase {
    #[must_use]
    pub fn new(id: impl Into<String>, access: AccessSettings) -> Self {
        Self {
            id: id.into(),
            access,
            oauth: None,
        }
    }

    #[must_use]
    pub fn with_oauth(mut self, oauth: OAuthClientConfig) -> Self {
        self.oauth = Some(oauth);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("knowledge base query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn knowledge_base(&self, kb_id: &str) -> Result<Option<KnowledgeBase>, TenantError>;

    /// Replace the OAuth client config of a knowledge base. Returns `false`
    /// when the knowledge base does not exist.
    async fn set_oauth_config(
        &self,
        kb_id: &str,
        config: OAuthClientConfig,
    ) -> Result<bool, TenantError>;
}

#[derive(Debug, Default)]
pub struct MemoryTenantDirectory {
    tenants: RwLock<HashMap<String, KnowledgeBase>>,
}

impl MemoryTenantDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, kb: KnowledgeBase) {
        self.tenants.write().await.insert(kb.id.clone(), kb);
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn knowledge_base(&self, kb_id: &str) -> Result<Option<KnowledgeBase>, TenantError> {
        Ok(self.tenants.read().await.get(kb_id).cloned())
    }

    async fn set_oauth_config(
        &self,
        kb_id: &str,
        config: OAuthClientConfig,
    ) -> Result<bool, TenantError> {
        let mut tenants = self.tenants.write().await;
        let Some(kb) = tenants.get_mut(kb_id) else {
            return Ok(false);
        };
        kb.oauth = Some(config);
        Ok(true)
    }
}

/// Shape of the `oauth_config` jsonb column.
#[derive(Debug, Serialize, Deserialize)]
struct OAuthConfigRecord {
    authorize_url: String,
    token_url: String,
    userinfo_url: String,
    client_id: String,
    client_secret: String,
    #[serde(default)]
    scopes: Vec<String>,
    callback_url: String,
}

impl From<OAuthConfigRecord> for OAuthClientConfig {
    fn from(record: OAuthConfigRecord) -> Self {
        Self {
            authorize_url: record.authorize_url,
            token_url: record.token_url,
            userinfo_url: record.userinfo_url,
            client_id: record.client_id,
            client_secret: SecretString::from(record.client_secret),
            scopes: record.scopes,
            callback_url: record.callback_url,
        }
    }
}

impl From<&OAuthClientConfig> for OAuthConfigRecord {
    fn from(config: &OAuthClientConfig) -> Self {
        Self {
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.expose_secret().to_string(),
            scopes: config.scopes.clone(),
            callback_url: config.callback_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn knowledge_base(&self, kb_id: &str) -> Result<Option<KnowledgeBase>, TenantError> {
        let query = r"
            SELECT id, base_url, hosts, oauth_config
            FROM knowledge_bases
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let Some(row) = sqlx::query(query)
            .bind(kb_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?
        else {
            return Ok(None);
        };

        let base_url: Option<String> = row.try_get("base_url")?;
        let oauth: Option<Json<OAuthConfigRecord>> = row.try_get("oauth_config")?;
        Ok(Some(KnowledgeBase {
            id: row.try_get("id")?,
            access: AccessSettings {
                base_url: base_url.filter(|url| !url.trim().is_empty()),
                hosts: row.try_get("hosts")?,
            },
            oauth: oauth.map(|Json(record)| record.into()),
        }))
    }

    async fn set_oauth_config(
        &self,
        kb_id: &str,
        config: OAuthClientConfig,
    ) -> Result<bool, TenantError> {
        let query = "UPDATE knowledge_bases SET oauth_config = $2 WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(kb_id)
            .bind(Json(OAuthConfigRecord::from(&config)))
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

    #[tokio::test]
    async fn memory_directory_lookup() {
        let directory = MemoryTenantDirectory::new();
        directory
            .insert(KnowledgeBase::new(
                "kb1",
                AccessSettings {
                    base_url: None,
                    hosts: vec!["wiki.example.com".to_string()],
                },
            ))
            .await;

        let kb = directory.knowledge_base("kb1").await.unwrap().unwrap();
        assert_eq!(kb.access.hosts, vec!["wiki.example.com".to_string()]);
        assert!(kb.oauth.is_none());
        assert!(directory.knowledge_base("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_directory_replaces_oauth_config() {
        let directory = MemoryTenantDirectory::new();
        directory
            .insert(KnowledgeBase::new("kb1", AccessSettings::default()))
            .await;
        let config = OAuthClientConfig {
            authorize_url: "https://idp.example.com/authorize".to_string(),
            token_url: "https://idp.example.com/token".to_string(),
            userinfo_url: "https://idp.example.com/userinfo".to_string(),
            client_id: "wiki".to_string(),
            client_secret: SecretString::from("s3cret".to_string()),
            scopes: vec!["openid".to_string()],
            callback_url: "https://wiki.example.com/api/v1/auth/oauth/callback".to_string(),
        };

        assert!(directory.set_oauth_config("kb1", config.clone()).await.unwrap());
        assert!(!directory.set_oauth_config("nope", config).await.unwrap());

        let kb = directory.knowledge_base("kb1").await.unwrap().unwrap();
        let oauth = kb.oauth.unwrap();
        assert_eq!(oauth.client_id, "wiki");
        assert_eq!(oauth.client_secret.expose_secret(), "s3cret");

        let stored = serde_json::to_value(OAuthConfigRecord::from(&oauth)).unwrap();
        assert_eq!(stored["client_secret"], "s3cret");
        assert_eq!(stored["scopes"], serde_json::json!(["openid"]));
    }

    #[test]
    fn oauth_record_conversion_keeps_fields() {
        let record: OAuthConfigRecord = serde_json::from_value(serde_json::json!({
            "authorize_url": "https://idp.example.com/authorize",
            "token_url": "https://idp.example.com/token",
            "userinfo_url": "https://idp.example.com/userinfo",
            "client_id": "wiki",
            "client_secret": "s3cret",
            "callback_url": "https://wiki.example.com/api/v1/auth/oauth/callback"
        }))
        .unwrap();
        let config = OAuthClientConfig::from(record);
        assert_eq!(config.client_id, "wiki");
        assert!(config.scopes.is_empty());
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
