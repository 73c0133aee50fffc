//! Reader identities and the per knowledge base OAuth client settings.

use axum::{
    Json,
    extract::{Extension, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use url::Url;
use utoipa::{IntoParams, ToSchema};

use super::{auth_groups::KbQuery, json_body, principal::require_admin, required};
use crate::{
    api::{AppState, error::ApiError},
    auths::AuthRecord,
    tenants::OAuthClientConfig,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthItem {
    pub id: i64,
    pub kb_id: String,
    pub source_type: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub ip: Option<String>,
    pub last_login_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<AuthRecord> for AuthItem {
    fn from(record: AuthRecord) -> Self {
        Self {
            id: record.id,
            kb_id: record.kb_id,
            source_type: record.source_type,
            username: record.username,
            avatar_url: record.avatar_url,
            ip: record.ip,
            last_login_at: record.last_login_at,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthListResponse {
    pub auths: Vec<AuthItem>,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/list",
    params(KbQuery),
    responses(
        (status = 200, description = "Reader identities of the knowledge base; ids are used as auth_ids.", body = AuthListResponse),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
pub async fn list_auths(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<KbQuery>,
) -> Result<Json<AuthListResponse>, ApiError> {
    require_admin(&headers, &state).await?;
    let kb_id = required(query.kb_id, "kb_id")?;
    let auths = state.auths.list_by_kb(&kb_id).await?;
    Ok(Json(AuthListResponse {
        auths: auths.into_iter().map(AuthItem::from).collect(),
    }))
}

/// OAuth client settings as shown to admins. The secret is never returned.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OAuthConfigView {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    pub client_secret_set: bool,
    pub scopes: Vec<String>,
    pub callback_url: String,
}

impl From<&OAuthClientConfig> for OAuthConfigView {
    fn from(config: &OAuthClientConfig) -> Self {
        Self {
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
            client_id: config.client_id.clone(),
            client_secret_set: true,
            scopes: config.scopes.clone(),
            callback_url: config.callback_url.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthConfigResponse {
    pub kb_id: String,
    pub config: Option<OAuthConfigView>,
    pub auths: Vec<AuthItem>,
}

/// A missing or empty `client_secret` keeps the stored one.
#[derive(Deserialize, ToSchema)]
pub struct SetOAuthConfigRequest {
    pub kb_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub callback_url: String,
}

impl std::fmt::Debug for SetOAuthConfigRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetOAuthConfigRequest")
            .field("kb_id", &self.kb_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeleteAuthQuery {
    /// Knowledge base id.
    pub kb_id: Option<String>,
    /// Reader identity id.
    pub id: Option<i64>,
}

fn http_url(value: &str, field: &str) -> Result<String, ApiError> {
    let value = value.trim();
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(value.to_string()),
        _ => Err(ApiError::InvalidRequest(format!(
            "{field} must be an absolute http(s) URL"
        ))),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/get",
    params(KbQuery),
    responses(
        (status = 200, description = "OAuth client settings and reader identities of the knowledge base.", body = AuthConfigResponse),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Knowledge base not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
pub async fn get_auth_config(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<KbQuery>,
) -> Result<Json<AuthConfigResponse>, ApiError> {
    require_admin(&headers, &state).await?;
    let kb_id = required(query.kb_id, "kb_id")?;
    let kb = state
        .tenants
        .knowledge_base(&kb_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("knowledge base {kb_id} not found")))?;
    let auths = state.auths.list_by_kb(&kb_id).await?;
    Ok(Json(AuthConfigResponse {
        kb_id,
        config: kb.oauth.as_ref().map(OAuthConfigView::from),
        auths: auths.into_iter().map(AuthItem::from).collect(),
    }))
}

#[utoipa::path(
    put,
    path = "/api/v1/auth/set",
    request_body = SetOAuthConfigRequest,
    responses(
        (status = 204, description = "OAuth client settings replaced."),
        (status = 400, description = "Invalid URL, missing client id or no secret to keep.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Knowledge base not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
pub async fn set_auth_config(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<SetOAuthConfigRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let kb_id = required(Some(request.kb_id), "kb_id")?;
    let client_id = required(Some(request.client_id), "client_id")?;

    let kb = state
        .tenants
        .knowledge_base(&kb_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("knowledge base {kb_id} not found")))?;
    let client_secret = match request.client_secret.filter(|secret| !secret.is_empty()) {
        Some(secret) => SecretString::from(secret),
        None => kb
            .oauth
            .map(|existing| existing.client_secret)
            .ok_or_else(|| ApiError::InvalidRequest("client_secret is required".to_string()))?,
    };

    let config = OAuthClientConfig {
        authorize_url: http_url(&request.authorize_url, "authorize_url")?,
        token_url: http_url(&request.token_url, "token_url")?,
        userinfo_url: http_url(&request.userinfo_url, "userinfo_url")?,
        client_id,
        client_secret,
        scopes: request
            .scopes
            .into_iter()
            .map(|scope| scope.trim().to_string())
            .filter(|scope| !scope.is_empty())
            .collect(),
        callback_url: http_url(&request.callback_url, "callback_url")?,
    };
    if !state.tenants.set_oauth_config(&kb_id, config).await? {
        return Err(ApiError::NotFound(format!("knowledge base {kb_id} not found")));
    }
    info!(kb_id = %kb_id, admin = %principal.user.account, "OAuth config updated");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/auth/delete",
    params(DeleteAuthQuery),
    responses(
        (status = 204, description = "Reader identity removed."),
        (status = 400, description = "Missing kb_id or id.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
        (status = 404, description = "No such identity in the knowledge base.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
pub async fn delete_auth(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<DeleteAuthQuery>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let kb_id = required(query.kb_id, "kb_id")?;
    let id = query
        .id
        .ok_or_else(|| ApiError::InvalidRequest("id is required".to_string()))?;
    if !state.auths.delete(&kb_id, id).await? {
        return Err(ApiError::NotFound(format!("auth {id} not found")));
    }
    info!(kb_id = %kb_id, auth_id = id, admin = %principal.user.account, "Reader identity deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_absolute_http_urls_are_accepted() {
        assert!(http_url(" https://idp.example.com/token ", "token_url").is_ok());
        assert!(http_url("http://localhost:8080/cb", "callback_url").is_ok());
        assert!(http_url("/relative/path", "token_url").is_err());
        assert!(http_url("javascript:alert(1)", "token_url").is_err());
    }
}
