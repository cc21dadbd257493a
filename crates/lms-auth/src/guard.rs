//! 授权守卫
//!
//! 把令牌校验、账户状态检查与角色/权限判定组合成一个 [`Decision`]。
//! 基础设施故障以 `Err` 返回，绝不伪装成允许或拒绝。

use std::sync::Arc;

use lms_core::PermissionPattern;
use lms_error::{LmsError, Result};

use crate::jwt::TokenService;
use crate::models::AuthContext;
use crate::rbac::PermissionCheck;
use crate::repository::IdentityRepository;

/// 拒绝原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    AuthenticationRequired,
    InvalidSession,
    InsufficientPermissions { required: String },
}

impl DenyReason {
    /// 稳定的原因码
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::AuthenticationRequired => "authentication_required",
            DenyReason::InvalidSession => "invalid_session",
            DenyReason::InsufficientPermissions { .. } => "insufficient_permissions",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            DenyReason::AuthenticationRequired | DenyReason::InvalidSession => 401,
            DenyReason::InsufficientPermissions { .. } => 403,
        }
    }

    pub fn into_error(self) -> LmsError {
        match self {
            DenyReason::AuthenticationRequired => LmsError::AuthenticationRequired {
                message: "未提供有效的认证凭据".to_string(),
            },
            DenyReason::InvalidSession => LmsError::InvalidSession {
                message: "账户不存在或已停用".to_string(),
            },
            DenyReason::InsufficientPermissions { required } => {
                LmsError::InsufficientPermissions { required }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow(AuthContext),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// 允许时返回上下文，拒绝时转换为错误
    pub fn into_result(self) -> Result<AuthContext> {
        match self {
            Decision::Allow(ctx) => Ok(ctx),
            Decision::Deny(reason) => Err(reason.into_error()),
        }
    }
}

/// 角色要求：any 表示 R∩U≠∅，all 表示 R⊆U
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequirement {
    pub roles: Vec<String>,
    pub require_all: bool,
}

impl RoleRequirement {
    pub fn any<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: false,
        }
    }

    pub fn all<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: true,
        }
    }

    pub fn single(role: impl Into<String>) -> Self {
        let role: String = role.into();
        Self::any([role])
    }

    pub fn is_satisfied_by(&self, held: &[String]) -> bool {
        let holds = |role: &String| held.contains(role);
        if self.require_all {
            self.roles.iter().all(holds)
        } else {
            self.roles.iter().any(holds)
        }
    }

    fn describe(&self) -> String {
        let joiner = if self.require_all { " & " } else { " | " };
        format!("role:{}", self.roles.join(joiner))
    }
}

/// 权限要求，构造时校验每个权限键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequirement {
    keys: Vec<String>,
    require_all: bool,
}

impl PermissionRequirement {
    pub fn new<I, S>(keys: I, require_all: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        for key in &keys {
            PermissionPattern::parse(key)?;
        }
        Ok(Self { keys, require_all })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn require_all(&self) -> bool {
        self.require_all
    }

    fn describe(&self) -> String {
        let joiner = if self.require_all { " & " } else { " | " };
        self.keys.join(joiner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Authenticated,
    Roles(RoleRequirement),
    Permissions(PermissionRequirement),
}

/// 授权守卫
#[derive(Clone)]
pub struct AuthorizationGuard {
    tokens: Arc<TokenService>,
    evaluator: Arc<dyn PermissionCheck>,
    identities: Arc<dyn IdentityRepository>,
}

impl AuthorizationGuard {
    pub fn new(
        tokens: Arc<TokenService>,
        evaluator: Arc<dyn PermissionCheck>,
        identities: Arc<dyn IdentityRepository>,
    ) -> Self {
        Self {
            tokens,
            evaluator,
            identities,
        }
    }

    pub fn evaluator(&self) -> &Arc<dyn PermissionCheck> {
        &self.evaluator
    }

    /// 校验访问令牌并确认账户仍然有效
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<Decision> {
        let Some(token) = bearer.filter(|t| !t.is_empty()) else {
            return Ok(Decision::Deny(DenyReason::AuthenticationRequired));
        };

        let claims = match self.tokens.validate_access_token(token) {
            Ok(claims) => claims,
            Err(e) if e.is_authentication_failure() => {
                tracing::debug!(reason = e.code(), "access token rejected");
                return Ok(Decision::Deny(DenyReason::AuthenticationRequired));
            }
            Err(e) => return Err(e),
        };
        let user_id = match claims.user_id() {
            Ok(id) => id,
            Err(_) => return Ok(Decision::Deny(DenyReason::AuthenticationRequired)),
        };

        match self.identities.find_by_id(user_id).await? {
            // 角色取自当前账户而非令牌快照
            Some(identity) if identity.is_active() => Ok(Decision::Allow(AuthContext {
                user_id,
                email: identity.email().to_string(),
                roles: identity.role_names(),
            })),
            Some(_) => {
                tracing::warn!(user_id = %user_id, "token presented for deactivated account");
                Ok(Decision::Deny(DenyReason::InvalidSession))
            }
            None => {
                tracing::warn!(user_id = %user_id, "token presented for unknown account");
                Ok(Decision::Deny(DenyReason::InvalidSession))
            }
        }
    }

    pub async fn authorize(&self, bearer: Option<&str>, requirement: &Requirement) -> Result<Decision> {
        match self.authenticate(bearer).await? {
            Decision::Allow(ctx) => self.authorize_context(ctx, requirement).await,
            deny => Ok(deny),
        }
    }

    /// 对已认证的上下文做角色/权限判定
    pub async fn authorize_context(&self, ctx: AuthContext, requirement: &Requirement) -> Result<Decision> {
        let (granted, required) = match requirement {
            Requirement::Authenticated => return Ok(Decision::Allow(ctx)),
            Requirement::Roles(roles) => (roles.is_satisfied_by(&ctx.roles), roles.describe()),
            Requirement::Permissions(permissions) => {
                let keys: Vec<&str> = permissions.keys.iter().map(String::as_str).collect();
                let granted = if permissions.require_all {
                    self.evaluator.user_has_all_permissions(ctx.user_id, &keys).await?
                } else {
                    self.evaluator.user_has_any_permission(ctx.user_id, &keys).await?
                };
                (granted, permissions.describe())
            }
        };

        if granted {
            Ok(Decision::Allow(ctx))
        } else {
            tracing::info!(user_id = %ctx.user_id, required = %required, "authorization denied");
            Ok(Decision::Deny(DenyReason::InsufficientPermissions { required }))
        }
    }
}
