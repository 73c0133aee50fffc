use axum::{Json, extract::Extension, http::HeaderMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::principal::require_auth;
use crate::{
    api::{AppState, error::ApiError},
    users::{Role, User},
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    pub id: String,
    pub account: String,
    pub role: Role,
    /// `true` when the caller used `Authorization: Bearer`, `false` for the
    /// session cookie.
    pub is_token: bool,
    pub last_access: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserItem {
    pub id: String,
    pub account: String,
    pub role: Role,
    pub last_access: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserItem {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            account: user.account,
            role: user.role,
            last_access: user.last_access,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserListResponse {
    pub users: Vec<UserItem>,
}

#[utoipa::path(
    get,
    path = "/api/v1/user",
    responses(
        (status = 200, description = "The authenticated user.", body = CurrentUser),
        (status = 401, description = "Missing or invalid session.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn current_user(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<CurrentUser>, ApiError> {
    let principal = require_auth(&headers, &state).await?;
    let is_token = principal.is_token();
    let user = principal.user;
    Ok(Json(CurrentUser {
        id: user.id,
        account: user.account,
        role: user.role,
        is_token,
        last_access: user.last_access,
        created_at: user.created_at,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/user/list",
    responses(
        (status = 200, description = "All console users.", body = UserListResponse),
        (status = 401, description = "Missing or invalid session.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn list_users(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<UserListResponse>, ApiError> {
    require_auth(&headers, &state).await?;
    let users = state.users.list().await?;
    Ok(Json(UserListResponse {
        users: users.into_iter().map(UserItem::from).collect(),
    }))
}
