pub mod admin;
pub mod config;
pub mod guard;
pub mod jwt;
pub mod memory;
pub mod middleware;
pub mod models;
pub mod password;
pub mod permissions;
pub mod pg;
pub mod policy;
pub mod rbac;
pub mod repository;
pub mod service;

// 重新导出核心类型
pub use admin::AdminService;
pub use config::AuthConfig;
pub use guard::{
    AuthorizationGuard, Decision, DenyReason, PermissionRequirement, Requirement, RoleRequirement,
};
pub use jwt::{Claims, IssuedRefreshToken, IssuedToken, TokenKind, TokenPair, TokenService};
pub use memory::{InMemoryDirectory, InMemoryRefreshTokenStore};
pub use middleware::{
    create_permission_middleware, create_role_middleware, AuthMiddleware, RequirePermission,
    RequireRole,
};
pub use models::{AuthContext, RoleInfo, TokenResponse, UserInfo};
pub use password::PasswordService;
pub use permissions::{Permission, PermissionGroup, SystemRole};
pub use rbac::{PermissionCheck, RbacService};
pub use repository::{IdentityRepository, RefreshTokenStore, RolePermissionRepository};
pub use service::AuthService;

// 错误类型
pub use lms_error::{LmsError, Result};
