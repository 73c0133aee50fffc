//! Auth group administration.
//!
//! Every route requires an admin session. Paths are derived on read and are
//! never accepted from the client.

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::{json_body, principal::require_admin, required};
use crate::{
    api::{AppState, error::ApiError},
    groups::{AuthGroupPatch, GroupWithPath, NewAuthGroup},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthGroupItem {
    pub id: i64,
    pub name: String,
    pub kb_id: String,
    pub parent_id: Option<i64>,
    pub position: f64,
    pub auth_ids: Vec<i64>,
    pub user_ids: Vec<String>,
    /// `/Root/Child/Leaf`, or the bare name for a root.
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GroupWithPath> for AuthGroupItem {
    fn from(resolved: GroupWithPath) -> Self {
        let group = resolved.group;
        Self {
            id: group.id,
            name: group.name,
            kb_id: group.kb_id,
            parent_id: group.parent_id,
            position: group.position,
            auth_ids: group.auth_ids.into_iter().collect(),
            user_ids: group.user_ids.into_iter().collect(),
            path: resolved.path,
            created_at: group.created_at,
            updated_at: group.updated_at,
        }
    }
}

/// `list` duplicates `groups` for older console builds.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthGroupListResponse {
    pub groups: Vec<AuthGroupItem>,
    pub list: Vec<AuthGroupItem>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct KbQuery {
    /// Knowledge base id.
    pub kb_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateAuthGroupRequest {
    pub name: String,
    pub kb_id: String,
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub auth_ids: Vec<i64>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateAuthGroupResponse {
    pub id: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateAuthGroupRequest {
    pub name: String,
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub auth_ids: Vec<i64>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserGroupsResponse {
    pub groups: Vec<AuthGroupItem>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateUserGroupsRequest {
    pub user_id: String,
    pub group_ids: Vec<i64>,
}

async fn list_for_kb(
    headers: &HeaderMap,
    state: &AppState,
    query: KbQuery,
) -> Result<Json<AuthGroupListResponse>, ApiError> {
    require_admin(headers, state).await?;
    let kb_id = required(query.kb_id, "kb_id")?;
    let groups: Vec<AuthGroupItem> = state
        .groups
        .list_auth_groups(&kb_id)
        .await?
        .into_iter()
        .map(AuthGroupItem::from)
        .collect();
    Ok(Json(AuthGroupListResponse {
        list: groups.clone(),
        groups,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/user/auth_group/list",
    params(KbQuery),
    responses(
        (status = 200, description = "Groups of the knowledge base with derived paths.", body = AuthGroupListResponse),
        (status = 400, description = "Missing kb_id.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn list_auth_groups(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<KbQuery>,
) -> Result<Json<AuthGroupListResponse>, ApiError> {
    list_for_kb(&headers, &state, query).await
}

#[utoipa::path(
    get,
    path = "/api/pro/v1/auth/group/list",
    params(KbQuery),
    responses(
        (status = 200, description = "Same as /api/v1/user/auth_group/list.", body = AuthGroupListResponse),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn list_auth_groups_pro(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<KbQuery>,
) -> Result<Json<AuthGroupListResponse>, ApiError> {
    list_for_kb(&headers, &state, query).await
}

#[utoipa::path(
    post,
    path = "/api/v1/user/auth_group/create",
    request_body = CreateAuthGroupRequest,
    responses(
        (status = 200, description = "Group created.", body = CreateAuthGroupResponse),
        (status = 400, description = "Empty name or invalid parent.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller is not an admin.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn create_auth_group(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<CreateAuthGroupRequest>, JsonRejection>,
) -> Result<Json<CreateAuthGroupResponse>, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let kb_id = required(Some(request.kb_id), "kb_id")?;
    let id = state
        .groups
        .create_auth_group(NewAuthGroup {
            name: request.name,
            kb_id,
            parent_id: request.parent_id,
            position: request.position,
            auth_ids: request.auth_ids.into_iter().collect(),
            user_ids: request.user_ids.into_iter().collect(),
        })
        .await?;
    info!(group_id = id, admin = %principal.user.account, "Auth group created");
    Ok(Json(CreateAuthGroupResponse { id }))
}

#[utoipa::path(
    get,
    path = "/api/v1/user/auth_group/{id}",
    params(("id" = i64, Path, description = "Group id")),
    responses(
        (status = 200, description = "The group with its derived path.", body = AuthGroupItem),
        (status = 404, description = "Group not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn get_auth_group(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<AuthGroupItem>, ApiError> {
    require_admin(&headers, &state).await?;
    let group = state.groups.get_auth_group(id).await?;
    Ok(Json(group.into()))
}

#[utoipa::path(
    put,
    path = "/api/v1/user/auth_group/{id}",
    params(("id" = i64, Path, description = "Group id")),
    request_body = UpdateAuthGroupRequest,
    responses(
        (status = 204, description = "Group updated."),
        (status = 400, description = "Empty name or invalid parent.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Group not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn update_auth_group(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<UpdateAuthGroupRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    state
        .groups
        .update_auth_group(
            id,
            AuthGroupPatch {
                name: request.name,
                parent_id: request.parent_id,
                position: request.position,
                auth_ids: request.auth_ids.into_iter().collect(),
                user_ids: request.user_ids.into_iter().collect(),
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/user/auth_group/{id}",
    params(("id" = i64, Path, description = "Group id")),
    responses(
        (status = 204, description = "Group deleted; children become roots."),
        (status = 404, description = "Group not found.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn delete_auth_group(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let principal = require_admin(&headers, &state).await?;
    state.groups.delete_auth_group(id).await?;
    info!(group_id = id, admin = %principal.user.account, "Auth group deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/user/groups",
    params(UserQuery),
    responses(
        (status = 200, description = "Groups the user belongs to.", body = UserGroupsResponse),
        (status = 400, description = "Missing user_id.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn get_user_groups(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserGroupsResponse>, ApiError> {
    require_admin(&headers, &state).await?;
    let user_id = required(query.user_id, "user_id")?;
    let groups = state
        .groups
        .get_user_groups(&user_id)
        .await?
        .into_iter()
        .map(AuthGroupItem::from)
        .collect();
    Ok(Json(UserGroupsResponse { groups }))
}

#[utoipa::path(
    put,
    path = "/api/v1/user/groups",
    request_body = UpdateUserGroupsRequest,
    responses(
        (status = 204, description = "Membership replaced."),
        (status = 404, description = "A listed group does not exist.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth_group"
)]
pub async fn update_user_groups(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<UpdateUserGroupsRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &state).await?;
    let request = json_body(payload)?;
    let user_id = required(Some(request.user_id), "user_id")?;
    state
        .groups
        .update_user_groups(&user_id, &request.group_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
