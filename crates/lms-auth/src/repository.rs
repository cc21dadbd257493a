//! 外部持久化抽象
//!
//! 核心只依赖这些特质，具体实现见 `memory`（进程内）和 `pg`（Postgres）。

use async_trait::async_trait;
use lms_core::{Email, PermissionPattern, Role, RoleName, UserId, UserIdentity};
use lms_error::Result;
use uuid::Uuid;

/// 用户身份仓储
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserIdentity>>;
    async fn find_by_email(&self, email: &Email) -> Result<Option<UserIdentity>>;
    async fn exists_by_email(&self, email: &Email) -> Result<bool>;
    /// 新建或覆盖；邮箱与其他用户冲突时返回 `Conflict`
    async fn save(&self, identity: &UserIdentity) -> Result<()>;
}

/// 角色/权限仓储
#[async_trait]
pub trait RolePermissionRepository: Send + Sync {
    async fn find_roles_for_user(&self, user_id: UserId) -> Result<Vec<Role>>;
    async fn find_permissions_for_user(&self, user_id: UserId) -> Result<Vec<PermissionPattern>>;
    async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<PermissionPattern>>;
    async fn find_role_by_name(&self, name: &RoleName) -> Result<Option<Role>>;
    async fn list_roles(&self) -> Result<Vec<Role>>;
    async fn save_role(&self, role: &Role) -> Result<()>;
    async fn delete_role(&self, role_id: Uuid) -> Result<()>;
}

/// 刷新令牌轮换存储
///
/// 每个用户只有一个活跃的令牌族。`compare_and_swap` 必须是原子的：
/// 同一期望值的并发调用中只有一个能成功。
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn current(&self, user_id: UserId) -> Result<Option<String>>;
    async fn store(&self, user_id: UserId, rotation_id: &str) -> Result<()>;
    async fn compare_and_swap(&self, user_id: UserId, expected: &str, next: &str) -> Result<bool>;
    async fn revoke(&self, user_id: UserId) -> Result<()>;
}
