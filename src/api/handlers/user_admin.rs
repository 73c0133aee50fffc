//! Console account administration.
//!
//! Creating accounts and managing guests require an admin session. Password
//! resets and deletions additionally refuse bearer-token callers: both must
//! come from an interactive console session.

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::{
    json_body,
    principal::{Principal, require_admin},
    required,
    users::{UserItem, UserListResponse},
};
use crate::{
    api::{AppState, error::ApiError},
    users::{Role, User, UserError, check_password_strength, hash_password, new_user},
};

#[derive(Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub account: String,
    pub password: String,
    pub role: Role,
}

impl std::fmt::Debug for CreateUserRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateUserRequest")
            .field("account", &self.account)
            .field("password", &"***")
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateGuestRequest {
    pub account: String,
    pub password: String,
}

impl std::fmt::Debug for CreateGuestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateGuestRequest")
            .field("account", &self.account)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateUserResponse {
    pub id: String,
}

/// An empty or missing password leaves the guest unchanged.
#[derive(Deserialize, ToSchema)]
pub struct UpdateGuestRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub id: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeleteUserQuery {
    pub user_id: Option<String>,
}

fn reject_token(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_token() {
        return Err(ApiError::PermissionDenied);
    }
    Ok(())
}

async fn create_account(
    state: &AppState,
    account: &str,
    password: &str,
    role: Role,
) -> Result<String, ApiError> {
    let account = account.trim();
    if account.is_empty() {
        return Err(UserError::EmptyAccount.into());
    }
    check_password_strength(password)?;
    let user = new_user(account, password, role)?;
    let id = user.id.clone();
    state.users.insert(user).await?;
    Ok(id)
}

async fn guest_by_id(state: &AppState, id: &str) -> Result<User, ApiError> {
    let user = state
        .users
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {id} not found")))?;
    if user.role != Role::Guest {
        return Err(ApiError::InvalidRequest(
            "only guest users can be managed here".to_string(),
        ));
    }
    Ok(user)
}

#[utoipa::path(
    post,
    path = "/api/v1/user/create",
    request_body = CreateUserRequest,
    responses(
        (status = 200, description = "User created.", body = CreateUserResponse),
        (status = 400, description = "Empty account, short password or account taken.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn create_user(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<CreateUserResponse>, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let id = create_account(&state, &request.account, &request.password, request.role).await?;
    info!(user_id = %id, role = %request.role, admin = %principal.user.account, "User created");
    Ok(Json(CreateUserResponse { id }))
}

#[utoipa::path(
    get,
    path = "/api/v1/user/guest/list",
    responses(
        (status = 200, description = "Guest accounts.", body = UserListResponse),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn list_guests(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<UserListResponse>, ApiError> {
    require_admin(&headers, &state).await?;
    let users = state.users.list().await?;
    Ok(Json(UserListResponse {
        users: users
            .into_iter()
            .filter(|user| user.role == Role::Guest)
            .map(UserItem::from)
            .collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/user/guest/create",
    request_body = CreateGuestRequest,
    responses(
        (status = 200, description = "Guest created.", body = CreateUserResponse),
        (status = 400, description = "Empty account, short password or account taken.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn create_guest(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<CreateGuestRequest>, JsonRejection>,
) -> Result<Json<CreateUserResponse>, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let id = create_account(&state, &request.account, &request.password, Role::Guest).await?;
    info!(user_id = %id, admin = %principal.user.account, "Guest created");
    Ok(Json(CreateUserResponse { id }))
}

#[utoipa::path(
    put,
    path = "/api/v1/user/guest/{id}",
    params(("id" = String, Path, description = "User id")),
    request_body = UpdateGuestRequest,
    responses(
        (status = 204, description = "Guest updated."),
        (status = 400, description = "Target is not a guest or the password is too short.", body = crate::api::error::ErrorBody),
        (status = 404, description = "User not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn update_guest(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateGuestRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let guest = guest_by_id(&state, &id).await?;

    if let Some(password) = request.password.filter(|password| !password.is_empty()) {
        check_password_strength(&password)?;
        state
            .users
            .update_password(&guest.id, &hash_password(&password)?)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/user/guest/{id}",
    params(("id" = String, Path, description = "User id")),
    responses(
        (status = 204, description = "Guest deleted."),
        (status = 400, description = "Target is not a guest.", body = crate::api::error::ErrorBody),
        (status = 404, description = "User not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn delete_guest(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let guest = guest_by_id(&state, &id).await?;
    state.users.delete(&guest.id).await?;
    info!(user_id = %guest.id, admin = %principal.user.account, "Guest deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/api/v1/user/reset_password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 204, description = "Password replaced."),
        (status = 400, description = "Password too short.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Token caller, non-admin caller, or another admin as target.", body = crate::api::error::ErrorBody),
        (status = 404, description = "User not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn reset_password(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    reject_token(&principal)?;
    let request = json_body(payload)?;
    let target_id = required(Some(request.id), "id")?;

    let target = state
        .users
        .get(&target_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {target_id} not found")))?;
    // Admins may change their own password but not another admin's.
    if target.role == Role::Admin && target.id != principal.user.id {
        return Err(ApiError::PermissionDenied);
    }

    check_password_strength(&request.new_password)?;
    state
        .users
        .update_password(&target.id, &hash_password(&request.new_password)?)
        .await?;
    info!(user_id = %target.id, admin = %principal.user.account, "Password reset");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/user/delete",
    params(DeleteUserQuery),
    responses(
        (status = 204, description = "User deleted."),
        (status = 400, description = "Missing user_id or attempt to delete yourself.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Token caller or non-admin caller.", body = crate::api::error::ErrorBody),
        (status = 404, description = "User not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "user"
)]
pub async fn delete_user(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<DeleteUserQuery>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    reject_token(&principal)?;
    let user_id = required(query.user_id, "user_id")?;
    if user_id == principal.user.id {
        return Err(ApiError::InvalidRequest(
            "cannot delete yourself".to_string(),
        ));
    }

    if !state.users.delete(&user_id).await? {
        return Err(ApiError::NotFound(format!("user {user_id} not found")));
    }
    info!(user_id = %user_id, admin = %principal.user.account, "User deleted");
    Ok(StatusCode::NO_CONTENT)
}
