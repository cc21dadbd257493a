use std::sync::Arc;

use lms_core::{Email, PermissionPattern, Role, RoleName, UserId, UserIdentity};
use lms_error::{LmsError, Result};

use crate::password::PasswordService;
use crate::permissions::SystemRole;
use crate::policy::{
    ensure_not_modifying_own_permissions, ensure_not_removing_own_admin,
    ensure_not_self_deactivation,
};
use crate::rbac::{dispatch_events, PermissionCheck};
use crate::repository::{IdentityRepository, RefreshTokenStore, RolePermissionRepository};
use crate::service::run_blocking;

const TEMPORARY_PASSWORD_LENGTH: usize = 16;

/// 管理用例：账户状态、角色分配、个人权限以及角色目录维护
///
/// 调用方负责在路由层完成角色检查，这里只执行自操作策略和业务规则。
#[derive(Clone)]
pub struct AdminService {
    identities: Arc<dyn IdentityRepository>,
    roles: Arc<dyn RolePermissionRepository>,
    refresh_store: Arc<dyn RefreshTokenStore>,
    permissions: Arc<dyn PermissionCheck>,
}

impl AdminService {
    pub fn new(
        identities: Arc<dyn IdentityRepository>,
        roles: Arc<dyn RolePermissionRepository>,
        refresh_store: Arc<dyn RefreshTokenStore>,
        permissions: Arc<dyn PermissionCheck>,
    ) -> Self {
        Self {
            identities,
            roles,
            refresh_store,
            permissions,
        }
    }

    async fn load_user(&self, user_id: UserId) -> Result<UserIdentity> {
        self.identities
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| LmsError::not_found(format!("user:{}", user_id)))
    }

    async fn load_role(&self, name: &str) -> Result<Role> {
        let name = RoleName::parse(name)?;
        self.roles
            .find_role_by_name(&name)
            .await?
            .ok_or_else(|| LmsError::not_found(format!("role:{}", name)))
    }

    async fn commit_user(&self, mut identity: UserIdentity) -> Result<UserIdentity> {
        if identity.pending_events().is_empty() {
            return Ok(identity);
        }
        self.identities.save(&identity).await?;
        dispatch_events(self.permissions.as_ref(), identity.take_events()).await;
        Ok(identity)
    }

    async fn commit_role(&self, mut role: Role) -> Result<Role> {
        if role.pending_events().is_empty() {
            return Ok(role);
        }
        self.roles.save_role(&role).await?;
        dispatch_events(self.permissions.as_ref(), role.take_events()).await;
        Ok(role)
    }

    fn ensure_grants_editable(role: &Role) -> Result<()> {
        if role.is_system() {
            return Err(LmsError::SystemRoleProtected {
                role: role.name().to_string(),
                operation: "modify permissions".to_string(),
            });
        }
        Ok(())
    }

    /// 停用账户并吊销其刷新令牌族；重复停用是无操作
    pub async fn deactivate_user(&self, actor: UserId, target: UserId) -> Result<UserIdentity> {
        ensure_not_self_deactivation(actor, target)?;
        let mut identity = self.load_user(target).await?;
        if identity.deactivate() {
            self.refresh_store.revoke(target).await?;
            tracing::info!(actor = %actor, user_id = %target, "user deactivated");
        }
        self.commit_user(identity).await
    }

    pub async fn activate_user(&self, actor: UserId, target: UserId) -> Result<UserIdentity> {
        let mut identity = self.load_user(target).await?;
        if identity.activate() {
            tracing::info!(actor = %actor, user_id = %target, "user activated");
        }
        self.commit_user(identity).await
    }

    pub async fn assign_role(&self, actor: UserId, target: UserId, role: &str) -> Result<UserIdentity> {
        let role = self.load_role(role).await?;
        let mut identity = self.load_user(target).await?;
        if identity.assign_role(role.name().clone()) {
            tracing::info!(actor = %actor, user_id = %target, role = %role.name(), "role assigned");
        }
        self.commit_user(identity).await
    }

    pub async fn remove_role(&self, actor: UserId, target: UserId, role: &str) -> Result<UserIdentity> {
        let role = RoleName::parse(role)?;
        ensure_not_removing_own_admin(actor, target, &role)?;
        let mut identity = self.load_user(target).await?;
        if identity.remove_role(&role) {
            tracing::info!(actor = %actor, user_id = %target, role = %role, "role removed");
        }
        self.commit_user(identity).await
    }

    /// 整体替换目标用户的个人权限
    pub async fn set_user_permissions(
        &self,
        actor: UserId,
        target: UserId,
        permissions: &[String],
    ) -> Result<UserIdentity> {
        ensure_not_modifying_own_permissions(actor, target)?;
        let patterns = permissions
            .iter()
            .map(|p| PermissionPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;

        let mut identity = self.load_user(target).await?;
        identity.set_permissions(patterns);
        tracing::info!(actor = %actor, user_id = %target, count = permissions.len(), "user permissions replaced");
        self.commit_user(identity).await
    }

    pub async fn create_role(
        &self,
        name: &str,
        description: Option<String>,
        permissions: &[String],
    ) -> Result<Role> {
        let name = RoleName::parse(name)?;
        let patterns = permissions
            .iter()
            .map(|p| PermissionPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;

        if self.roles.find_role_by_name(&name).await?.is_some() {
            return Err(LmsError::Conflict {
                details: format!("role already exists: {}", name),
            });
        }

        let mut role = Role::new(name, description)?;
        for pattern in patterns {
            role.grant(pattern);
        }
        self.commit_role(role).await
    }

    pub async fn rename_role(&self, name: &str, new_name: &str) -> Result<Role> {
        let mut role = self.load_role(name).await?;
        let new_name = RoleName::parse(new_name)?;
        if &new_name != role.name() && self.roles.find_role_by_name(&new_name).await?.is_some() {
            return Err(LmsError::Conflict {
                details: format!("role already exists: {}", new_name),
            });
        }
        role.rename(new_name)?;
        self.commit_role(role).await
    }

    /// 删除自定义角色；持有该角色的用户随之失去它
    pub async fn delete_role(&self, name: &str) -> Result<()> {
        let role = self.load_role(name).await?;
        role.ensure_deletable()?;
        self.roles.delete_role(role.id()).await?;
        self.permissions.invalidate_all_permissions().await;
        tracing::info!(role = %role.name(), "role deleted");
        Ok(())
    }

    pub async fn grant_role_permission(&self, name: &str, permission: &str) -> Result<Role> {
        let pattern = PermissionPattern::parse(permission)?;
        let mut role = self.load_role(name).await?;
        Self::ensure_grants_editable(&role)?;
        role.grant(pattern);
        self.commit_role(role).await
    }

    pub async fn revoke_role_permission(&self, name: &str, permission: &str) -> Result<Role> {
        let pattern = PermissionPattern::parse(permission)?;
        let mut role = self.load_role(name).await?;
        Self::ensure_grants_editable(&role)?;
        role.revoke(&pattern);
        self.commit_role(role).await
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        self.roles.list_roles().await
    }

    pub async fn role_permissions(&self, name: &str) -> Result<Vec<PermissionPattern>> {
        let role = self.load_role(name).await?;
        self.roles.find_permissions_for_role(role.id()).await
    }

    /// 为目标账户生成临时密码并吊销其令牌族；返回明文临时密码，仅此一次
    pub async fn reset_password(&self, actor: UserId, target: UserId) -> Result<String> {
        let mut identity = self.load_user(target).await?;
        let temporary = PasswordService::generate_password(TEMPORARY_PASSWORD_LENGTH);

        let plain = temporary.clone();
        let hash = run_blocking(move || PasswordService::hash_unchecked(&plain)).await?;
        identity.change_password(hash);
        self.commit_user(identity).await?;
        self.refresh_store.revoke(target).await?;
        tracing::info!(actor = %actor, user_id = %target, "password reset by administrator");
        Ok(temporary)
    }

    /// 创建缺失的内置角色，已存在的保持不变；返回新建数量
    pub async fn seed_system_roles(&self) -> Result<usize> {
        let mut created = 0;
        for name in SystemRole::all() {
            let role_name = RoleName::parse(name)?;
            if self.roles.find_role_by_name(&role_name).await?.is_some() {
                continue;
            }

            let role = if role_name.is_admin() {
                Role::system_admin()
            } else {
                let mut role = Role::new(role_name, Some(format!("内置角色: {}", name)))?;
                for key in SystemRole::get_default_permissions(name) {
                    role.grant(PermissionPattern::parse(key)?);
                }
                role
            };
            self.commit_role(role).await?;
            created += 1;
        }

        if created > 0 {
            tracing::info!(created, "system roles seeded");
        }
        Ok(created)
    }

    /// 确保引导管理员账户存在并持有 admin 角色
    pub async fn ensure_admin_account(&self, email: &str, password: &str) -> Result<UserIdentity> {
        let email = Email::parse(email)?;
        let admin = RoleName::admin();

        let mut identity = match self.identities.find_by_email(&email).await? {
            Some(identity) => identity,
            None => {
                let password = password.to_string();
                let hash = run_blocking(move || PasswordService::hash_unchecked(&password)).await?;
                tracing::info!(email = %email, "bootstrap admin account created");
                UserIdentity::register(email, hash, Some("Administrator".to_string()))
            }
        };
        identity.assign_role(admin);
        self.commit_user(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryDirectory, InMemoryRefreshTokenStore};
    use crate::rbac::RbacService;

    struct Fixture {
        dir: Arc<InMemoryDirectory>,
        store: Arc<InMemoryRefreshTokenStore>,
        rbac: Arc<RbacService>,
        admin: AdminService,
    }

    async fn fixture() -> Fixture {
        let dir = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemoryRefreshTokenStore::new());
        let rbac = Arc::new(RbacService::new(dir.clone()));
        let admin = AdminService::new(dir.clone(), dir.clone(), store.clone(), rbac.clone());
        assert_eq!(admin.seed_system_roles().await.unwrap(), 3);
        Fixture {
            dir,
            store,
            rbac,
            admin,
        }
    }

    async fn user(fx: &Fixture, email: &str) -> UserId {
        let identity = UserIdentity::register(
            Email::parse(email).unwrap(),
            lms_core::PasswordHash::from_hash("h"),
            None,
        );
        fx.dir.save(&identity).await.unwrap();
        identity.id()
    }

    #[tokio::test]
    async fn test_seeding_is_idempotent() {
        let fx = fixture().await;
        assert_eq!(fx.admin.seed_system_roles().await.unwrap(), 0);
        let names: Vec<String> = fx
            .admin
            .list_roles()
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["admin", "instructor", "student"]);
        assert_eq!(
            fx.admin.role_permissions("admin").await.unwrap(),
            vec![PermissionPattern::Global]
        );
    }

    #[tokio::test]
    async fn test_admin_cannot_deactivate_self() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let err = fx.admin.deactivate_user(me, me).await.unwrap_err();
        assert!(matches!(err, LmsError::SelfActionForbidden { .. }));
        assert!(fx.dir.find_by_id(me).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_deactivation_is_idempotent_and_revokes_tokens() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;
        fx.store.store(target, "rotation-1").await.unwrap();

        let first = fx.admin.deactivate_user(me, target).await.unwrap();
        assert!(!first.is_active());
        assert!(fx.store.current(target).await.unwrap().is_none());

        let second = fx.admin.deactivate_user(me, target).await.unwrap();
        assert!(!second.is_active());

        let reactivated = fx.admin.activate_user(me, target).await.unwrap();
        assert!(reactivated.is_active());
    }

    #[tokio::test]
    async fn test_reset_password_issues_usable_temporary_password() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;
        fx.store.store(target, "rotation-1").await.unwrap();

        let temporary = fx.admin.reset_password(me, target).await.unwrap();
        assert_eq!(temporary.chars().count(), 16);
        assert!(PasswordService::validate_password_strength(&temporary).is_ok());
        assert!(fx.store.current(target).await.unwrap().is_none());

        let stored = fx.dir.find_by_id(target).await.unwrap().unwrap();
        assert!(PasswordService::verify_password(&temporary, stored.password()).unwrap());

        let missing = fx.admin.reset_password(me, UserId::new()).await.unwrap_err();
        assert!(matches!(missing, LmsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cannot_remove_own_admin_role() {
        let fx = fixture().await;
        let me = fx
            .admin
            .ensure_admin_account("root@example.com", "bootstrap")
            .await
            .unwrap()
            .id();
        let err = fx.admin.remove_role(me, me, "admin").await.unwrap_err();
        assert!(matches!(err, LmsError::SelfActionForbidden { .. }));

        // 其他角色可以从自己身上移除
        fx.admin.assign_role(me, me, "student").await.unwrap();
        let updated = fx.admin.remove_role(me, me, "student").await.unwrap();
        assert_eq!(updated.role_names(), vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn test_cannot_modify_own_permissions() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let err = fx
            .admin
            .set_user_permissions(me, me, &["reports:*".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LmsError::SelfActionForbidden { .. }));
    }

    #[tokio::test]
    async fn test_assign_role_refreshes_effective_permissions() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;

        assert!(!fx.rbac.user_has_permission(target, "lessons:write").await.unwrap());
        fx.admin.assign_role(me, target, "instructor").await.unwrap();
        assert!(fx.rbac.user_has_permission(target, "lessons:write").await.unwrap());

        let err = fx.admin.assign_role(me, target, "ghost").await.unwrap_err();
        assert!(matches!(err, LmsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_set_permissions_validates_and_invalidates() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;

        assert!(!fx.rbac.user_has_permission(target, "reports:export").await.unwrap());
        fx.admin
            .set_user_permissions(me, target, &["reports:*".to_string()])
            .await
            .unwrap();
        assert!(fx.rbac.user_has_permission(target, "reports:export").await.unwrap());

        let err = fx
            .admin
            .set_user_permissions(me, target, &["*:read".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LmsError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_role_grant_changes_apply_to_all_holders() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;
        fx.admin
            .create_role("editor", None, &["posts:read".to_string()])
            .await
            .unwrap();
        fx.admin.assign_role(me, target, "editor").await.unwrap();
        assert!(!fx.rbac.user_has_permission(target, "posts:write").await.unwrap());

        fx.admin.grant_role_permission("editor", "posts:write").await.unwrap();
        assert!(fx.rbac.user_has_permission(target, "posts:write").await.unwrap());

        fx.admin.revoke_role_permission("editor", "posts:write").await.unwrap();
        assert!(!fx.rbac.user_has_permission(target, "posts:write").await.unwrap());
    }

    #[tokio::test]
    async fn test_system_role_is_protected() {
        let fx = fixture().await;
        for err in [
            fx.admin.rename_role("admin", "root").await.unwrap_err(),
            fx.admin.delete_role("admin").await.unwrap_err(),
            fx.admin.revoke_role_permission("admin", "*").await.unwrap_err(),
            fx.admin.create_role("admin", None, &[]).await.unwrap_err(),
        ] {
            assert!(
                matches!(err, LmsError::SystemRoleProtected { .. } | LmsError::Conflict { .. }),
                "{:?}",
                err
            );
        }
        assert!(matches!(
            fx.admin.delete_role("admin").await.unwrap_err(),
            LmsError::SystemRoleProtected { .. }
        ));
        assert!(matches!(
            fx.admin.rename_role("student", "admin").await.unwrap_err(),
            LmsError::Conflict { .. } | LmsError::SystemRoleProtected { .. }
        ));
    }

    #[tokio::test]
    async fn test_rename_and_delete_custom_role() {
        let fx = fixture().await;
        let me = user(&fx, "root@example.com").await;
        let target = user(&fx, "bob@example.com").await;
        fx.admin
            .create_role("editor", None, &["posts:write".to_string()])
            .await
            .unwrap();
        fx.admin.assign_role(me, target, "editor").await.unwrap();

        let renamed = fx.admin.rename_role("editor", "author").await.unwrap();
        assert_eq!(renamed.name().as_str(), "author");
        assert!(fx.rbac.user_has_permission(target, "posts:write").await.unwrap());

        let err = fx.admin.create_role("author", None, &[]).await.unwrap_err();
        assert!(matches!(err, LmsError::Conflict { .. }));

        fx.admin.delete_role("author").await.unwrap();
        assert!(!fx.rbac.user_has_permission(target, "posts:write").await.unwrap());
        assert!(fx.admin.rename_role("author", "writer").await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_admin_account_is_idempotent() {
        let fx = fixture().await;
        let first = fx
            .admin
            .ensure_admin_account("root@example.com", "bootstrap")
            .await
            .unwrap();
        let second = fx
            .admin
            .ensure_admin_account("ROOT@example.com", "bootstrap")
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(fx.dir.user_count().await, 1);
        assert!(fx.rbac.user_has_permission(first.id(), "anything:goes").await.unwrap());
    }
}
