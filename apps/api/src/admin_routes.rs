use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson},
    routing::{delete, get, post, put},
    Router,
};
use lms_auth::{
    create_permission_middleware, create_role_middleware,
    models::{
        AssignRoleRequest, CreateRoleRequest, PasswordResetResponse, RenameRoleRequest,
        RolePermissionRequest, SetPermissionsRequest,
    },
    AuthContext, AuthMiddleware, Permission, PermissionGroup, RoleInfo, SystemRole, UserInfo,
};
use lms_core::UserId;
use lms_error::Result;

use crate::AppState;

/// 管理路由，仅 admin 角色可访问
pub fn create_admin_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/permissions", get(list_permission_groups))
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:name", put(rename_role).delete(delete_role))
        .route(
            "/roles/:name/permissions",
            get(role_permissions).post(grant_role_permission),
        )
        .route(
            "/roles/:name/permissions/:permission",
            delete(revoke_role_permission),
        )
        .route("/users/:id/deactivate", post(deactivate_user))
        .route("/users/:id/activate", post(activate_user))
        .route("/users/:id/reset-password", post(reset_password))
        .route("/users/:id/roles", post(assign_role))
        .route("/users/:id/roles/:role", delete(remove_role))
        .route("/users/:id/permissions", put(set_user_permissions))
        .layer(create_role_middleware(&[SystemRole::ADMIN], false))
        .layer(AuthMiddleware::layer(state.guard.clone()))
}

/// 用户查询路由，按权限而不是角色放行
pub fn create_user_routes(state: &AppState) -> lms_error::Result<Router<AppState>> {
    Ok(Router::new()
        .route("/users/:id", get(get_user))
        .layer(create_permission_middleware(
            state.guard.clone(),
            &[Permission::USERS_READ, Permission::USERS_MANAGE],
            false,
        )?)
        .layer(AuthMiddleware::layer(state.guard.clone())))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<UserId>) -> Result<ResponseJson<UserInfo>> {
    Ok(ResponseJson(state.auth.me(id).await?))
}

async fn list_permission_groups() -> ResponseJson<Vec<PermissionGroup>> {
    ResponseJson(PermissionGroup::all_groups())
}

async fn list_roles(State(state): State<AppState>) -> Result<ResponseJson<Vec<RoleInfo>>> {
    let roles = state.admin.list_roles().await?;
    Ok(ResponseJson(roles.iter().map(RoleInfo::from).collect()))
}

async fn create_role(
    State(state): State<AppState>,
    Json(request): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse> {
    let role = state
        .admin
        .create_role(&request.name, request.description, &request.permissions)
        .await?;
    Ok((StatusCode::CREATED, ResponseJson(RoleInfo::from(&role))))
}

async fn rename_role(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RenameRoleRequest>,
) -> Result<ResponseJson<RoleInfo>> {
    let role = state.admin.rename_role(&name, &request.name).await?;
    Ok(ResponseJson(RoleInfo::from(&role)))
}

async fn delete_role(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode> {
    state.admin.delete_role(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn role_permissions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<Vec<String>>> {
    let permissions = state.admin.role_permissions(&name).await?;
    Ok(ResponseJson(permissions.iter().map(ToString::to_string).collect()))
}

async fn grant_role_permission(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RolePermissionRequest>,
) -> Result<ResponseJson<RoleInfo>> {
    let role = state
        .admin
        .grant_role_permission(&name, &request.permission)
        .await?;
    Ok(ResponseJson(RoleInfo::from(&role)))
}

async fn revoke_role_permission(
    State(state): State<AppState>,
    Path((name, permission)): Path<(String, String)>,
) -> Result<ResponseJson<RoleInfo>> {
    let role = state.admin.revoke_role_permission(&name, &permission).await?;
    Ok(ResponseJson(RoleInfo::from(&role)))
}

async fn deactivate_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<UserId>,
) -> Result<ResponseJson<UserInfo>> {
    state.admin.deactivate_user(auth.user_id, id).await?;
    Ok(ResponseJson(state.auth.me(id).await?))
}

async fn activate_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<UserId>,
) -> Result<ResponseJson<UserInfo>> {
    state.admin.activate_user(auth.user_id, id).await?;
    Ok(ResponseJson(state.auth.me(id).await?))
}

async fn reset_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<UserId>,
) -> Result<ResponseJson<PasswordResetResponse>> {
    let temporary_password = state.admin.reset_password(auth.user_id, id).await?;
    Ok(ResponseJson(PasswordResetResponse {
        user_id: id,
        temporary_password,
    }))
}

async fn assign_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<UserId>,
    Json(request): Json<AssignRoleRequest>,
) -> Result<ResponseJson<UserInfo>> {
    state.admin.assign_role(auth.user_id, id, &request.role).await?;
    Ok(ResponseJson(state.auth.me(id).await?))
}

async fn remove_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, role)): Path<(UserId, String)>,
) -> Result<ResponseJson<UserInfo>> {
    state.admin.remove_role(auth.user_id, id, &role).await?;
    Ok(ResponseJson(state.auth.me(id).await?))
}

async fn set_user_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<UserId>,
    Json(request): Json<SetPermissionsRequest>,
) -> Result<ResponseJson<UserInfo>> {
    state
        .admin
        .set_user_permissions(auth.user_id, id, &request.permissions)
        .await?;
    Ok(ResponseJson(state.auth.me(id).await?))
}
