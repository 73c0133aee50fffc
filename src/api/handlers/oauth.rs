//! Third-party login for wiki readers.
//!
//! Flow Overview:
//! 1) `authorize` checks the redirect target, stores a single-use state with a
//!    PKCE verifier and sends the browser to the provider.
//! 2) `callback` redeems the state, exchanges the code, records the reader
//!    identity, issues a session and sends the browser back to the stored
//!    redirect target.

use axum::{
    extract::{Extension, Query},
    http::{StatusCode, header::LOCATION, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::IntoParams;

use super::{ClientIp, required};
use crate::{
    api::{AppState, error::ApiError},
    oauth::{OAuthError, authorization_url, pkce},
};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeQuery {
    pub kb_id: Option<String>,
    /// Where to send the browser after login; must pass the tenant's
    /// redirect check.
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

fn found(location: &str) -> Result<Response, ApiError> {
    let location = location
        .parse::<axum::http::HeaderValue>()
        .map_err(|_| ApiError::InvalidRequest("invalid redirect url".to_string()))?;
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/oauth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 302, description = "Redirect to the identity provider."),
        (status = 400, description = "Redirect rejected or OAuth not configured.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Unknown knowledge base.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn authorize(
    state: Extension<Arc<AppState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ApiError> {
    let kb_id = required(query.kb_id, "kb_id")?;
    let redirect_url = required(query.redirect_url, "redirect_url")?;

    let kb = state.oauth.knowledge_base(&kb_id).await?;
    let config = kb
        .oauth
        .ok_or_else(|| OAuthError::NotConfigured(kb_id.clone()))?;

    let verifier = pkce::generate_verifier().map_err(OAuthError::from)?;
    let token = state
        .oauth
        .generate_state(&kb_id, &redirect_url, &verifier)
        .await?;
    let url = authorization_url(&config, &token, &pkce::challenge_s256(&verifier))
        .map_err(OAuthError::from)?;
    found(url.as_str())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/oauth/callback",
    params(CallbackQuery),
    responses(
        (status = 302, description = "Session cookie set; redirect to the original target."),
        (status = 400, description = "Unknown, expired or reused state.", body = crate::api::error::ErrorBody),
        (status = 401, description = "Code exchange failed.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all, fields(ip = %ip.0))]
pub async fn callback(
    ip: ClientIp,
    state: Extension<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let token = required(query.state, "state")?;
    // The state is consumed before anything else can fail.
    let info = state.oauth.validate_state(&token).await?;
    let code = required(query.code, "code")?;

    let kb = state.oauth.knowledge_base(&info.kb_id).await?;
    let config = kb
        .oauth
        .ok_or_else(|| OAuthError::NotConfigured(info.kb_id.clone()))?;

    let identity = state
        .identity
        .exchange(&config, &code, &info.verifier)
        .await?;
    let auth = state
        .auths
        .record_login(&info.kb_id, &identity, Some(&ip.0))
        .await?;
    let issued = state
        .sessions
        .issue(&auth.id.to_string(), Some(&info.kb_id))
        .await?;
    let cookie = state
        .sessions
        .cookie(&issued.token)
        .map_err(|err| ApiError::internal("Failed to build session cookie", &err))?;

    info!(kb_id = %info.kb_id, auth_id = auth.id, "OAuth login succeeded");
    let mut response = found(&info.redirect_url)?;
    response.headers_mut().insert(SET_COOKIE, cookie);
    Ok(response)
}
