use std::future::Future;
use std::pin::Pin;

use axum::{
    body::Body,
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use lms_error::Result;
use tower_http::auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer};

use crate::guard::{
    AuthorizationGuard, Decision, DenyReason, PermissionRequirement, Requirement, RoleRequirement,
};
use crate::jwt::TokenService;
use crate::models::AuthContext;

type AuthorizeFuture<B> =
    Pin<Box<dyn Future<Output = std::result::Result<Request<B>, Response<Body>>> + Send>>;

/// 拒绝响应：`{"error": code, "message": ...}`
pub fn deny_response(reason: DenyReason) -> Response {
    tracing::debug!(reason = reason.code(), "request denied");
    reason.into_error().into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(TokenService::extract_bearer)
}

/// 认证中间件：校验 Bearer 令牌并把 [`AuthContext`] 放入请求扩展
#[derive(Clone)]
pub struct AuthMiddleware {
    guard: AuthorizationGuard,
}

impl AuthMiddleware {
    pub fn new(guard: AuthorizationGuard) -> Self {
        Self { guard }
    }

    pub fn layer(guard: AuthorizationGuard) -> AsyncRequireAuthorizationLayer<Self> {
        AsyncRequireAuthorizationLayer::new(Self::new(guard))
    }
}

impl<B> AsyncAuthorizeRequest<B> for AuthMiddleware
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = Body;
    type Future = AuthorizeFuture<B>;

    fn authorize(&mut self, request: Request<B>) -> Self::Future {
        let guard = self.guard.clone();

        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let decision = guard.authenticate(bearer_token(&parts.headers)).await;

            match decision {
                Ok(Decision::Allow(auth_context)) => {
                    parts.extensions.insert(auth_context);
                    Ok(Request::from_parts(parts, body))
                }
                Ok(Decision::Deny(reason)) => Err(deny_response(reason)),
                Err(e) => Err(e.into_response()),
            }
        })
    }
}

/// 角色检查中间件，读取令牌中的角色，需位于 [`AuthMiddleware`] 之后
#[derive(Clone)]
pub struct RequireRole {
    requirement: RoleRequirement,
}

impl<B> AsyncAuthorizeRequest<B> for RequireRole
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = Body;
    type Future = AuthorizeFuture<B>;

    fn authorize(&mut self, request: Request<B>) -> Self::Future {
        let requirement = self.requirement.clone();

        Box::pin(async move {
            let Some(auth) = request.extensions().get::<AuthContext>() else {
                return Err(deny_response(DenyReason::AuthenticationRequired));
            };

            if requirement.is_satisfied_by(&auth.roles) {
                Ok(request)
            } else {
                tracing::info!(
                    user_id = %auth.user_id,
                    required = ?requirement.roles,
                    require_all = requirement.require_all,
                    "role requirement not met"
                );
                Err(deny_response(DenyReason::InsufficientPermissions {
                    required: requirement.roles.join(","),
                }))
            }
        })
    }
}

/// 权限检查中间件，委托给守卫的权限评估
#[derive(Clone)]
pub struct RequirePermission {
    guard: AuthorizationGuard,
    requirement: Requirement,
}

impl<B> AsyncAuthorizeRequest<B> for RequirePermission
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = Body;
    type Future = AuthorizeFuture<B>;

    fn authorize(&mut self, request: Request<B>) -> Self::Future {
        let guard = self.guard.clone();
        let requirement = self.requirement.clone();

        Box::pin(async move {
            let Some(auth) = request.extensions().get::<AuthContext>().cloned() else {
                return Err(deny_response(DenyReason::AuthenticationRequired));
            };

            match guard.authorize_context(auth, &requirement).await {
                Ok(Decision::Allow(_)) => Ok(request),
                Ok(Decision::Deny(reason)) => Err(deny_response(reason)),
                Err(e) => Err(e.into_response()),
            }
        })
    }
}

/// 角色中间件：`require_all` 为 false 时任一角色即可
pub fn create_role_middleware(
    roles: &[&str],
    require_all: bool,
) -> AsyncRequireAuthorizationLayer<RequireRole> {
    let requirement = if require_all {
        RoleRequirement::all(roles.iter().copied())
    } else {
        RoleRequirement::any(roles.iter().copied())
    };
    AsyncRequireAuthorizationLayer::new(RequireRole { requirement })
}

/// 权限中间件；权限键在构造时校验
pub fn create_permission_middleware(
    guard: AuthorizationGuard,
    keys: &[&str],
    require_all: bool,
) -> Result<AsyncRequireAuthorizationLayer<RequirePermission>> {
    let requirement = PermissionRequirement::new(keys.iter().copied(), require_all)?;
    Ok(AsyncRequireAuthorizationLayer::new(RequirePermission {
        guard,
        requirement: Requirement::Permissions(requirement),
    }))
}
