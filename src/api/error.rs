//! JSON error envelope for the HTTP surface.
//!
//! Domain errors map to a stable `code`. Infrastructure failures are logged
//! here and rendered with a generic message so internals never leak.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::error;
use utoipa::ToSchema;

use crate::{
    auths::AuthError, groups::GroupError, oauth::OAuthError, session::SessionError,
    store::StoreError, tenants::TenantError, users::UserError,
};

const INTERNAL_MESSAGE: &str = "internal server error";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Only set for `locked`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    Unauthorized,
    PermissionDenied,
    NotFound(String),
    Locked { remaining: Duration },
    Internal,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Locked { .. } => "locked",
            Self::Internal => "internal",
        }
    }

    /// Log `err` and return the generic internal error.
    pub fn internal(context: &str, err: &dyn std::fmt::Display) -> Self {
        error!("{context}: {err}");
        Self::Internal
    }
}

/// Whole seconds, rounded up so a client never retries early.
fn retry_after_seconds(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code().to_string();
        let (message, retry_after) = match self {
            Self::InvalidRequest(message) | Self::NotFound(message) => (message, None),
            Self::Unauthorized => ("authentication required".to_string(), None),
            Self::PermissionDenied => ("permission denied".to_string(), None),
            Self::Locked { remaining } => {
                let seconds = retry_after_seconds(remaining);
                (
                    format!("too many failed logins, try again in {seconds} seconds"),
                    Some(seconds),
                )
            }
            Self::Internal => (INTERNAL_MESSAGE.to_string(), None),
        };

        let body = ErrorBody {
            code,
            message,
            retry_after_seconds: retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<GroupError> for ApiError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::EmptyName
            | GroupError::SelfParent
            | GroupError::ParentNotFound(_)
            | GroupError::ParentInOtherKb(_) => Self::InvalidRequest(err.to_string()),
            GroupError::NotFound(_) => Self::NotFound(err.to_string()),
            GroupError::Database(_) => Self::internal("Auth group operation failed", &err),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::TenantNotFound(_) => Self::NotFound(err.to_string()),
            OAuthError::RedirectRejected
            | OAuthError::StateNotFound
            | OAuthError::NotConfigured(_) => Self::InvalidRequest(err.to_string()),
            OAuthError::Provider(_) => {
                error!("OAuth provider exchange failed: {err}");
                Self::Unauthorized
            }
            OAuthError::StateCollision
            | OAuthError::Random(_)
            | OAuthError::Payload(_)
            | OAuthError::Url(_)
            | OAuthError::Store(_)
            | OAuthError::Tenant(_) => Self::internal("OAuth operation failed", &err),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::internal("Session operation failed", &err)
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::AccountTaken(_)
            | UserError::UnknownRole(_)
            | UserError::EmptyAccount
            | UserError::WeakPassword => Self::InvalidRequest(err.to_string()),
            UserError::Hash(_) | UserError::Database(_) => {
                Self::internal("User operation failed", &err)
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::internal("Auth record operation failed", &err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal("Store operation failed", &err)
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        Self::internal("Tenant lookup failed", &err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_seconds(Duration::from_secs(900)), 900);
        assert_eq!(retry_after_seconds(Duration::ZERO), 0);
    }

    #[test]
    fn locked_sets_retry_after_header() {
        let response = ApiError::Locked {
            remaining: Duration::from_secs(60),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).unwrap().to_str().unwrap(),
            "60"
        );
    }

    #[test]
    fn group_errors_map_to_stable_codes() {
        assert_eq!(ApiError::from(GroupError::NotFound(7)).code(), "not_found");
        assert_eq!(
            ApiError::from(GroupError::SelfParent).code(),
            "invalid_request"
        );
        assert_eq!(ApiError::from(GroupError::EmptyName).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oauth_errors_map_to_stable_codes() {
        assert_eq!(
            ApiError::from(OAuthError::StateNotFound).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(OAuthError::TenantNotFound("kb".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(OAuthError::StateCollision).code(),
            "internal"
        );
    }

    #[test]
    fn user_validation_errors_are_client_errors() {
        assert_eq!(
            ApiError::from(UserError::AccountTaken("bob".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(UserError::WeakPassword).code(),
            "invalid_request"
        );
    }
}
