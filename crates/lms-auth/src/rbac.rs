use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lms_core::{DomainEvent, EffectivePermissionSet, PermissionImpact, PermissionPattern, UserId};
use lms_error::{LmsError, Result};
use tokio::sync::RwLock;

use crate::repository::RolePermissionRepository;

/// 权限检查特质
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn get_effective_permissions(&self, user_id: UserId) -> Result<EffectivePermissionSet>;
    async fn user_has_permission(&self, user_id: UserId, permission: &str) -> Result<bool>;
    /// 空列表返回 false
    async fn user_has_any_permission(&self, user_id: UserId, permissions: &[&str]) -> Result<bool>;
    /// 空列表返回 true
    async fn user_has_all_permissions(&self, user_id: UserId, permissions: &[&str]) -> Result<bool>;
    async fn invalidate_user_permissions(&self, user_id: UserId);
    async fn invalidate_all_permissions(&self);
    async fn get_user_roles(&self, user_id: UserId) -> Result<Vec<String>>;
}

/// RBAC服务 - 计算并缓存用户的有效权限
pub struct RbacService {
    repository: Arc<dyn RolePermissionRepository>,
    permission_cache: RwLock<HashMap<UserId, EffectivePermissionSet>>,
    // 每次失效递增；加载期间发生失效则不写回缓存
    generation: AtomicU64,
}

impl RbacService {
    pub fn new(repository: Arc<dyn RolePermissionRepository>) -> Self {
        Self {
            repository,
            permission_cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 当前缓存的用户数
    pub async fn cached_users(&self) -> usize {
        self.permission_cache.read().await.len()
    }

    fn parse_keys(permissions: &[&str]) -> Result<Vec<PermissionPattern>> {
        permissions.iter().map(|p| PermissionPattern::parse(p)).collect()
    }

    fn lookup_failed(operation: &str, user_id: UserId, error: LmsError) -> LmsError {
        tracing::error!(
            user_id = %user_id,
            operation = operation,
            error = %error,
            "permission lookup failed"
        );
        LmsError::PermissionLookupFailed {
            message: format!("{}: {}", operation, error),
        }
    }

    async fn load_permissions(&self, user_id: UserId) -> Result<EffectivePermissionSet> {
        let roles = self
            .repository
            .find_roles_for_user(user_id)
            .await
            .map_err(|e| Self::lookup_failed("find_roles_for_user", user_id, e))?;
        let direct = self
            .repository
            .find_permissions_for_user(user_id)
            .await
            .map_err(|e| Self::lookup_failed("find_permissions_for_user", user_id, e))?;

        let mut permissions = EffectivePermissionSet::new();
        for role in &roles {
            permissions.extend(role.permissions().iter().cloned());
        }
        permissions.extend(direct);

        tracing::debug!(
            user_id = %user_id,
            roles = roles.len(),
            permissions = permissions.len(),
            "effective permissions loaded"
        );
        Ok(permissions)
    }
}

#[async_trait]
impl PermissionCheck for RbacService {
    async fn get_effective_permissions(&self, user_id: UserId) -> Result<EffectivePermissionSet> {
        // 尝试从缓存获取
        {
            let cache = self.permission_cache.read().await;
            if let Some(permissions) = cache.get(&user_id) {
                return Ok(permissions.clone());
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        let permissions = self.load_permissions(user_id).await?;

        // 更新缓存
        {
            let mut cache = self.permission_cache.write().await;
            if self.generation.load(Ordering::Acquire) == generation {
                cache.insert(user_id, permissions.clone());
            }
        }

        Ok(permissions)
    }

    async fn user_has_permission(&self, user_id: UserId, permission: &str) -> Result<bool> {
        let requested = PermissionPattern::parse(permission)?;
        let permissions = self.get_effective_permissions(user_id).await?;
        Ok(permissions.satisfies(&requested))
    }

    async fn user_has_any_permission(&self, user_id: UserId, permissions: &[&str]) -> Result<bool> {
        let requested = Self::parse_keys(permissions)?;
        if requested.is_empty() {
            return Ok(false);
        }
        let held = self.get_effective_permissions(user_id).await?;
        Ok(requested.iter().any(|p| held.satisfies(p)))
    }

    async fn user_has_all_permissions(&self, user_id: UserId, permissions: &[&str]) -> Result<bool> {
        let requested = Self::parse_keys(permissions)?;
        if requested.is_empty() {
            return Ok(true);
        }
        let held = self.get_effective_permissions(user_id).await?;
        Ok(requested.iter().all(|p| held.satisfies(p)))
    }

    async fn invalidate_user_permissions(&self, user_id: UserId) {
        let mut cache = self.permission_cache.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        cache.remove(&user_id);
        tracing::debug!(user_id = %user_id, "permission cache invalidated");
    }

    async fn invalidate_all_permissions(&self) {
        let mut cache = self.permission_cache.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        cache.clear();
        tracing::debug!("permission cache cleared");
    }

    async fn get_user_roles(&self, user_id: UserId) -> Result<Vec<String>> {
        let roles = self
            .repository
            .find_roles_for_user(user_id)
            .await
            .map_err(|e| Self::lookup_failed("find_roles_for_user", user_id, e))?;
        Ok(roles.iter().map(|r| r.name().to_string()).collect())
    }
}

/// 发布聚合产生的领域事件：记录日志并按影响范围失效权限缓存
pub async fn dispatch_events(evaluator: &dyn PermissionCheck, events: Vec<DomainEvent>) {
    let mut invalidate_all = false;
    let mut affected = Vec::new();

    for event in &events {
        tracing::info!(event = event.name(), payload = ?event, "domain event");
        match event.permission_impact() {
            PermissionImpact::None => {}
            PermissionImpact::User(user_id) => affected.push(user_id),
            PermissionImpact::AllUsers => invalidate_all = true,
        }
    }

    if invalidate_all {
        evaluator.invalidate_all_permissions().await;
        return;
    }
    affected.sort();
    affected.dedup();
    for user_id in affected {
        evaluator.invalidate_user_permissions(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDirectory;
    use crate::repository::IdentityRepository;
    use lms_core::{Email, PasswordHash, Role, RoleName, UserIdentity};
    use uuid::Uuid;

    fn pattern(s: &str) -> PermissionPattern {
        PermissionPattern::parse(s).unwrap()
    }

    async fn setup(role_perms: &[&str], direct: &[&str]) -> (Arc<InMemoryDirectory>, RbacService, UserId) {
        let dir = Arc::new(InMemoryDirectory::new());
        let mut editor = Role::new(RoleName::parse("editor").unwrap(), None).unwrap();
        for p in role_perms {
            editor.grant(pattern(p));
        }
        dir.save_role(&editor).await.unwrap();

        let mut user = UserIdentity::register(
            Email::parse("alice@example.com").unwrap(),
            PasswordHash::from_hash("h"),
            None,
        );
        user.assign_role(editor.name().clone());
        user.set_permissions(direct.iter().map(|p| pattern(p)));
        dir.save(&user).await.unwrap();

        let service = RbacService::new(dir.clone());
        (dir, service, user.id())
    }

    #[tokio::test]
    async fn test_role_and_direct_permissions_union() {
        let (_dir, rbac, user) = setup(&["posts:write"], &["reports:*"]).await;

        assert!(rbac.user_has_permission(user, "posts:write").await.unwrap());
        assert!(rbac.user_has_permission(user, "reports:export").await.unwrap());
        assert!(!rbac.user_has_permission(user, "users:delete").await.unwrap());

        let effective = rbac.get_effective_permissions(user).await.unwrap();
        assert_eq!(
            effective.to_sorted_strings(),
            vec!["posts:write".to_string(), "reports:*".to_string()]
        );
    }

    #[tokio::test]
    async fn test_effective_permissions_stable_without_writes() {
        let (_dir, rbac, user) = setup(&["posts:read", "posts:write"], &["posts:read", "reports:*"]).await;

        let first = rbac.get_effective_permissions(user).await.unwrap();
        let cached = rbac.get_effective_permissions(user).await.unwrap();
        rbac.invalidate_user_permissions(user).await;
        let reloaded = rbac.get_effective_permissions(user).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first, cached);
        assert_eq!(first, reloaded);
    }

    #[tokio::test]
    async fn test_global_wildcard() {
        let (_dir, rbac, user) = setup(&["*"], &[]).await;
        assert!(rbac.user_has_permission(user, "anything:at_all").await.unwrap());
        assert!(rbac.user_has_permission(user, "courses:*").await.unwrap());
    }

    #[tokio::test]
    async fn test_any_all_empty_lists() {
        let (_dir, rbac, user) = setup(&["posts:read"], &[]).await;
        assert!(!rbac.user_has_any_permission(user, &[]).await.unwrap());
        assert!(rbac.user_has_all_permissions(user, &[]).await.unwrap());
        assert!(rbac
            .user_has_any_permission(user, &["users:delete", "posts:read"])
            .await
            .unwrap());
        assert!(!rbac
            .user_has_all_permissions(user, &["users:delete", "posts:read"])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_malformed_key_is_validation_error() {
        let (_dir, rbac, user) = setup(&["posts:read"], &[]).await;
        for bad in ["posts", "*:read", "Posts:read", ""] {
            let err = rbac.user_has_permission(user, bad).await.unwrap_err();
            assert!(matches!(err, LmsError::Validation { .. }), "{}", bad);
        }
        let err = rbac
            .user_has_any_permission(user, &["posts:read", "bad"])
            .await
            .unwrap_err();
        assert!(matches!(err, LmsError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_cache_invalidation_picks_up_changes() {
        let (dir, rbac, user) = setup(&["posts:read"], &[]).await;
        assert!(!rbac.user_has_permission(user, "reports:view").await.unwrap());
        assert_eq!(rbac.cached_users().await, 1);

        let mut identity = dir.find_by_id(user).await.unwrap().unwrap();
        identity.set_permissions([pattern("reports:view")]);
        dir.save(&identity).await.unwrap();

        // 未失效前仍读取缓存
        assert!(!rbac.user_has_permission(user, "reports:view").await.unwrap());
        rbac.invalidate_user_permissions(user).await;
        assert!(rbac.user_has_permission(user, "reports:view").await.unwrap());

        rbac.invalidate_all_permissions().await;
        assert_eq!(rbac.cached_users().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_permissions() {
        let (_dir, rbac, _) = setup(&["posts:read"], &[]).await;
        let stranger = UserId::new();
        assert!(rbac.get_effective_permissions(stranger).await.unwrap().is_empty());
        assert!(rbac.get_user_roles(stranger).await.unwrap().is_empty());
    }

    struct FailingRepository;

    #[async_trait]
    impl RolePermissionRepository for FailingRepository {
        async fn find_roles_for_user(&self, _: UserId) -> Result<Vec<Role>> {
            Err(LmsError::database("find_roles_for_user", "connection refused"))
        }
        async fn find_permissions_for_user(&self, _: UserId) -> Result<Vec<PermissionPattern>> {
            Err(LmsError::database("find_permissions_for_user", "connection refused"))
        }
        async fn find_permissions_for_role(&self, _: Uuid) -> Result<Vec<PermissionPattern>> {
            unreachable!()
        }
        async fn find_role_by_name(&self, _: &RoleName) -> Result<Option<Role>> {
            unreachable!()
        }
        async fn list_roles(&self) -> Result<Vec<Role>> {
            unreachable!()
        }
        async fn save_role(&self, _: &Role) -> Result<()> {
            unreachable!()
        }
        async fn delete_role(&self, _: Uuid) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_error_not_decision() {
        let rbac = RbacService::new(Arc::new(FailingRepository));
        let err = rbac
            .user_has_permission(UserId::new(), "posts:read")
            .await
            .unwrap_err();
        assert!(matches!(err, LmsError::PermissionLookupFailed { .. }));
        assert!(err.is_retryable());
        assert_eq!(rbac.cached_users().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_events_invalidates_by_impact() {
        let (_dir, rbac, user) = setup(&["posts:read"], &[]).await;
        rbac.get_effective_permissions(user).await.unwrap();
        let other = UserId::new();
        rbac.get_effective_permissions(other).await.unwrap();
        assert_eq!(rbac.cached_users().await, 2);

        let now = chrono::Utc::now();
        dispatch_events(
            &rbac,
            vec![DomainEvent::RoleAssigned {
                user_id: user,
                role: "editor".to_string(),
                at: now,
            }],
        )
        .await;
        assert_eq!(rbac.cached_users().await, 1);

        dispatch_events(
            &rbac,
            vec![DomainEvent::RolePermissionGranted {
                role_id: Uuid::now_v7(),
                permission: "posts:write".to_string(),
                at: now,
            }],
        )
        .await;
        assert_eq!(rbac.cached_users().await, 0);
    }
}
