//! Authenticated principal extraction and role checks.
//!
//! Flow Overview: read the bearer token or session cookie, resolve it to a
//! live session, then load the console user it belongs to.

use axum::http::HeaderMap;

use crate::{
    api::{AppState, error::ApiError},
    session::{Credential, SessionRecord, extract_session_token},
    users::{Role, User},
};

#[derive(Clone, Debug)]
pub struct Principal {
    pub user: User,
    pub session: SessionRecord,
    pub credential: Credential,
    /// Raw token as presented, kept for logout.
    pub token: String,
}

impl Principal {
    #[must_use]
    pub fn is_token(&self) -> bool {
        self.credential == Credential::Bearer
    }
}

/// Resolve the caller to a console user, or `Unauthorized`.
///
/// # Errors
/// Returns [`ApiError::Unauthorized`] for missing, expired or unknown
/// sessions and [`ApiError::Internal`] on store failures.
pub async fn require_auth(headers: &HeaderMap, state: &AppState) -> Result<Principal, ApiError> {
    let (token, credential) = extract_session_token(headers).ok_or(ApiError::Unauthorized)?;
    let session = state
        .sessions
        .authenticate(&token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    // OAuth sessions belong to wiki readers, not console users.
    let user = state
        .users
        .get(&session.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Principal {
        user,
        session,
        credential,
        token,
    })
}

/// Like [`require_auth`] but also requires the admin role.
///
/// # Errors
/// Returns [`ApiError::PermissionDenied`] for authenticated non-admins.
pub async fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<Principal, ApiError> {
    let principal = require_auth(headers, state).await?;
    if principal.user.role == Role::Admin {
        Ok(principal)
    } else {
        Err(ApiError::PermissionDenied)
    }
}
