//! OAuth handshake correlation.
//!
//! Flow Overview:
//! 1) `authorize` validates the caller's redirect target for the knowledge
//!    base, creates a PKCE verifier and stores `StateInfo` under a random state
//!    token with set-if-absent and a 15-minute TTL.
//! 2) The provider redirects back with `state` and `code`. The state entry is
//!    removed atomically on read, so a replayed callback finds nothing.
//! 3) The redirect target is re-validated against current tenant settings
//!    before the code is exchanged and a session is issued.

pub mod pkce;
pub mod provider;

pub use provider::{ExternalIdentity, HttpIdentityProvider, IdentityProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{instrument, warn};
use url::Url;

use crate::{
    store::{KeyedStore, StoreError},
    tenants::{AccessSettings, KnowledgeBase, OAuthClientConfig, TenantDirectory, TenantError},
    token::generate_token,
};

pub const STATE_TTL: Duration = Duration::from_secs(15 * 60);
const STATE_KEY_PREFIX: &str = "oauth:state:";
const MAX_STATE_ATTEMPTS: usize = 3;

fn state_key(token: &str) -> String {
    format!("{STATE_KEY_PREFIX}{token}")
}

/// Payload stored behind a state token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo {
    pub kb_id: String,
    pub redirect_url: String,
    pub verifier: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("knowledge base {0} not found")]
    TenantNotFound(String),
    #[error("redirect url is not allowed for this knowledge base")]
    RedirectRejected,
    #[error("oauth state is missing, expired or already used")]
    StateNotFound,
    #[error("oauth login is not configured for knowledge base {0}")]
    NotConfigured(String),
    #[error("could not allocate a unique oauth state")]
    StateCollision,
    #[error("random generator failed: {0}")]
    Random(#[from] rand::Error),
    #[error("malformed oauth state payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
    #[error("identity provider request failed: {0}")]
    Provider(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

/// Open-redirect check against a tenant's access settings.
///
/// Only absolute http(s) URLs with a host pass. With a base URL configured the
/// hosts must match exactly (ports are ignored); otherwise the host must be on
/// the allow-list.
#[must_use]
pub fn redirect_allowed(access: &AccessSettings, redirect_url: &str) -> bool {
    let Some(host) = http_host(redirect_url) else {
        return false;
    };

    match access
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|base| !base.is_empty())
    {
        Some(base) => http_host(base).is_some_and(|base_host| base_host == host),
        None => access
            .hosts
            .iter()
            .any(|allowed| normalize_host(allowed) == host),
    }
}

fn http_host(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Allow-list entries are bare hosts, optionally with a port.
fn normalize_host(entry: &str) -> String {
    let entry = entry.trim().to_ascii_lowercase();
    match entry.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => entry,
    }
}

/// Provider redirect for the authorization code flow with PKCE.
///
/// # Errors
/// Returns an error if the configured authorize URL is not a valid URL.
pub fn authorization_url(
    config: &OAuthClientConfig,
    state: &str,
    code_challenge: &str,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&config.authorize_url)?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.callback_url)
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
    if !config.scopes.is_empty() {
        url.query_pairs_mut()
            .append_pair("scope", &config.scopes.join(" "));
    }
    Ok(url)
}

/// Issues and redeems single-use OAuth state tokens.
pub struct OAuthStateManager {
    store: Arc<dyn KeyedStore>,
    tenants: Arc<dyn TenantDirectory>,
    ttl: Duration,
}

impl std::fmt::Debug for OAuthStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthStateManager")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl OAuthStateManager {
    #[must_use]
    pub fn new(store: Arc<dyn KeyedStore>, tenants: Arc<dyn TenantDirectory>) -> Self {
        Self {
            store,
            tenants,
            ttl: STATE_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// # Errors
    /// Returns [`OAuthError::TenantNotFound`] for an unknown knowledge base.
    pub async fn knowledge_base(&self, kb_id: &str) -> Result<KnowledgeBase, OAuthError> {
        self.tenants
            .knowledge_base(kb_id)
            .await?
            .ok_or_else(|| OAuthError::TenantNotFound(kb_id.to_string()))
    }

    /// Whether `redirect_url` may be used as a post-login target for `kb_id`.
    ///
    /// # Errors
    /// Returns [`OAuthError::TenantNotFound`] for an unknown knowledge base and
    /// propagates directory failures.
    #[instrument(skip(self))]
    pub async fn validate_redirect_url(
        &self,
        kb_id: &str,
        redirect_url: &str,
    ) -> Result<bool, OAuthError> {
        let kb = self.knowledge_base(kb_id).await?;
        Ok(redirect_allowed(&kb.access, redirect_url))
    }

    /// Store a new state entry and return its token.
    ///
    /// # Errors
    /// Returns [`OAuthError::RedirectRejected`] when the redirect fails
    /// validation, and [`OAuthError::StateCollision`] if no unused token could
    /// be allocated.
    #[instrument(skip(self, verifier))]
    pub async fn generate_state(
        &self,
        kb_id: &str,
        redirect_url: &str,
        verifier: &str,
    ) -> Result<String, OAuthError> {
        if !self.validate_redirect_url(kb_id, redirect_url).await? {
            return Err(OAuthError::RedirectRejected);
        }

        let info = StateInfo {
            kb_id: kb_id.to_string(),
            redirect_url: redirect_url.to_string(),
            verifier: verifier.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
        };
        let payload = serde_json::to_string(&info)?;

        for _ in 0..MAX_STATE_ATTEMPTS {
            let token = generate_token()?;
            if self
                .store
                .set_if_absent(&state_key(&token), &payload, self.ttl)
                .await?
            {
                return Ok(token);
            }
            warn!("oauth state token collision, retrying");
        }
        Err(OAuthError::StateCollision)
    }

    /// Redeem a state token. The entry is gone after this call whether or not
    /// the remaining checks pass.
    ///
    /// # Errors
    /// Returns [`OAuthError::StateNotFound`] for unknown, expired or reused
    /// tokens and [`OAuthError::RedirectRejected`] when the stored redirect no
    /// longer passes validation.
    #[instrument(skip_all)]
    pub async fn validate_state(&self, token: &str) -> Result<StateInfo, OAuthError> {
        if token.trim().is_empty() {
            return Err(OAuthError::StateNotFound);
        }
        let payload = self
            .store
            .take(&state_key(token))
            .await?
            .ok_or(OAuthError::StateNotFound)?;
        let info: StateInfo = serde_json::from_str(&payload)?;

        if info.expires_at <= Utc::now() {
            return Err(OAuthError::StateNotFound);
        }
        if !self
            .validate_redirect_url(&info.kb_id, &info.redirect_url)
            .await?
        {
            return Err(OAuthError::RedirectRejected);
        }
        Ok(info)
    }
}
