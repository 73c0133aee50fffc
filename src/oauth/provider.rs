//! Authorization code exchange against a standard OAuth2 provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use super::OAuthError;
use crate::{APP_USER_AGENT, tenants::OAuthClientConfig};

/// The external account behind a completed OAuth login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    /// Stable provider-side id (`sub`, or `id` for non-OIDC providers).
    pub subject: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange `code` (with its PKCE `verifier`) for the caller's identity.
    async fn exchange(
        &self,
        config: &OAuthClientConfig,
        code: &str,
        verifier: &str,
    ) -> Result<ExternalIdentity, OAuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: Client,
}

impl HttpIdentityProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

fn provider_error(err: &reqwest::Error) -> OAuthError {
    OAuthError::Provider(err.to_string())
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip_all, fields(token_url = %config.token_url))]
    async fn exchange(
        &self,
        config: &OAuthClientConfig,
        code: &str,
        verifier: &str,
    ) -> Result<ExternalIdentity, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.callback_url.as_str()),
            ("code_verifier", verifier),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
        ];
        let token: TokenResponse = self
            .client
            .post(&config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| provider_error(&err))?
            .json()
            .await
            .map_err(|err| provider_error(&err))?;

        let userinfo: Value = self
            .client
            .get(&config.userinfo_url)
            .bearer_auth(&token.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| provider_error(&err))?
            .json()
            .await
            .map_err(|err| provider_error(&err))?;
        debug!("userinfo received");

        identity_from_userinfo(&userinfo)
            .ok_or_else(|| OAuthError::Provider("userinfo response has no subject".to_string()))
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| match value.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .next()
}

/// Map an OIDC or GitHub-style userinfo document to an identity.
fn identity_from_userinfo(userinfo: &Value) -> Option<ExternalIdentity> {
    Some(ExternalIdentity {
        subject: string_field(userinfo, &["sub", "id"])?,
        username: string_field(userinfo, &["preferred_username", "name", "login", "email"]),
        avatar_url: string_field(userinfo, &["picture", "avatar_url"]),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oidc_userinfo() {
        let identity = identity_from_userinfo(&json!({
            "sub": "248289761001",
            "preferred_username": "jane",
            "picture": "https://example.com/jane.png"
        }))
        .unwrap();
        assert_eq!(identity.subject, "248289761001");
        assert_eq!(identity.username.as_deref(), Some("jane"));
        assert_eq!(
            identity.avatar_url.as_deref(),
            Some("https://example.com/jane.png")
        );
    }

    #[test]
    fn numeric_id_userinfo() {
        let identity = identity_from_userinfo(&json!({
            "id": 583231,
            "login": "octocat",
            "avatar_url": "https://example.com/octocat.png"
        }))
        .unwrap();
        assert_eq!(identity.subject, "583231");
        assert_eq!(identity.username.as_deref(), Some("octocat"));
    }

    #[test]
    fn missing_subject_is_rejected() {
        assert!(identity_from_userinfo(&json!({"name": "nobody"})).is_none());
        assert!(identity_from_userinfo(&json!({"sub": "  "})).is_none());
    }
}
