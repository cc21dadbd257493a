use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{DateTime, Utc};
use lms_core::{Role, UserId, UserIdentity, ADMIN_ROLE};
use lms_error::LmsError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jwt::TokenPair;

/// 认证上下文 - 通过守卫后附加到请求上的调用者信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: UserId,
    pub email: String,
    /// 令牌签发时的角色
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    pub fn has_all_roles(&self, roles: &[&str]) -> bool {
        roles.iter().all(|r| self.has_role(r))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = LmsError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| LmsError::AuthenticationRequired {
                message: "未提供有效的认证凭据".to_string(),
            })
    }
}

/// API请求和响应类型
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        let expires_in = (pair.access.expires_at - Utc::now()).num_seconds().max(0);
        Self {
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_expires_at: pair.refresh.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl UserInfo {
    /// `permissions` 为有效权限（角色 ∪ 个人）
    pub fn new(identity: &UserIdentity, permissions: Vec<String>) -> Self {
        Self {
            id: identity.id(),
            email: identity.email().to_string(),
            display_name: identity.display_name().map(str::to_string),
            is_active: identity.is_active(),
            roles: identity.role_names(),
            permissions,
            created_at: identity.created_at(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignRoleRequest {
    pub role: String,
}

/// 管理员重置密码的结果，临时密码只返回这一次
#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordResetResponse {
    pub user_id: UserId,
    pub temporary_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPermissionsRequest {
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameRoleRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RolePermissionRequest {
    pub permission: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleInfo {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Role> for RoleInfo {
    fn from(role: &Role) -> Self {
        Self {
            id: role.id(),
            name: role.name().to_string(),
            description: role.description().map(str::to_string),
            is_system: role.is_system(),
            permissions: role.permissions().iter().map(ToString::to_string).collect(),
            created_at: role.created_at(),
        }
    }
}
