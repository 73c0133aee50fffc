//! Console login and logout.
//!
//! Flow Overview:
//! 1) Reject the request early when the caller's IP is locked out.
//! 2) Verify account and password; a failure is counted against the IP.
//! 3) On success queue the counter reset, issue a new session and set the
//!    cookie. The reset never delays the response.

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use super::{ClientIp, json_body};
use crate::{
    api::{AppState, error::ApiError},
    session::extract_session_token,
    users::{verify_password, verify_unknown_account},
};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub account: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("account", &self.account)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/user/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued; also set as cookie.", body = LoginResponse),
        (status = 400, description = "Missing account or password.", body = crate::api::error::ErrorBody),
        (status = 401, description = "Invalid credentials.", body = crate::api::error::ErrorBody),
        (status = 429, description = "Too many failed logins from this IP.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
#[instrument(skip_all, fields(ip = %ip.0))]
pub async fn login(
    ip: ClientIp,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(payload)?;
    let account = request.account.trim();
    if account.is_empty() || request.password.is_empty() {
        return Err(ApiError::InvalidRequest(
            "account and password are required".to_string(),
        ));
    }

    let lock = state.limiter.check_ip_locked(&ip.0).await;
    if lock.locked {
        warn!("Login rejected, IP is locked out");
        return Err(ApiError::Locked {
            remaining: lock.remaining,
        });
    }

    let user = state.users.get_by_account(account).await?;
    let verified = match &user {
        Some(user) => verify_password(&request.password, &user.password_hash),
        None => verify_unknown_account(&request.password),
    };
    let Some(user) = user.filter(|_| verified) else {
        match state.limiter.lock_attempt(&ip.0).await {
            Ok(failures) => debug!(failures, "Login failed"),
            Err(err) => error!("Failed to record login failure: {err}"),
        }
        return Err(ApiError::Unauthorized);
    };

    state.resets.dispatch(&ip.0);

    let issued = state.sessions.issue(&user.id, None).await?;
    if let Err(err) = state.users.touch_last_access(&user.id).await {
        error!("Failed to update last access: {err}");
    }
    let cookie = state
        .sessions
        .cookie(&issued.token)
        .map_err(|err| ApiError::internal("Failed to build session cookie", &err))?;

    info!(user_id = %user.id, "Login succeeded");
    Ok((
        StatusCode::OK,
        [(SET_COOKIE, cookie)],
        Json(LoginResponse {
            token: issued.token,
        }),
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/api/v1/user/logout",
    responses(
        (status = 204, description = "Session revoked and cookie cleared."),
    ),
    tag = "user"
)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Response, ApiError> {
    if let Some((token, _)) = extract_session_token(&headers) {
        state.sessions.revoke(&token).await?;
    }
    let cookie = state
        .sessions
        .clear_cookie()
        .map_err(|err| ApiError::internal("Failed to build session cookie", &err))?;
    Ok((StatusCode::NO_CONTENT, [(SET_COOKIE, cookie)]).into_response())
}
