use std::collections::HashMap;

use async_trait::async_trait;
use lms_core::{Email, PermissionPattern, Role, RoleName, UserId, UserIdentity};
use lms_error::{LmsError, Result};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::jwt::rotation_matches;
use crate::repository::{IdentityRepository, RefreshTokenStore, RolePermissionRepository};

/// 基于内存的用户/角色目录，同时实现两个仓储特质
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, UserIdentity>>,
    roles: RwLock<HashMap<Uuid, Role>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前用户数量
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl IdentityRepository for InMemoryDirectory {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserIdentity>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &Email) -> Result<Option<UserIdentity>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email() == email).cloned())
    }

    async fn exists_by_email(&self, email: &Email) -> Result<bool> {
        let users = self.users.read().await;
        Ok(users.values().any(|u| u.email() == email))
    }

    async fn save(&self, identity: &UserIdentity) -> Result<()> {
        let mut users = self.users.write().await;
        let conflict = users
            .values()
            .any(|u| u.email() == identity.email() && u.id() != identity.id());
        if conflict {
            return Err(LmsError::Conflict {
                details: format!("email already registered: {}", identity.email()),
            });
        }

        let mut stored = identity.clone();
        stored.take_events();
        users.insert(identity.id(), stored);
        Ok(())
    }
}

#[async_trait]
impl RolePermissionRepository for InMemoryDirectory {
    async fn find_roles_for_user(&self, user_id: UserId) -> Result<Vec<Role>> {
        let users = self.users.read().await;
        let Some(user) = users.get(&user_id) else {
            return Ok(Vec::new());
        };
        let roles = self.roles.read().await;
        Ok(user
            .roles()
            .filter_map(|name| roles.values().find(|r| r.name() == name).cloned())
            .collect())
    }

    async fn find_permissions_for_user(&self, user_id: UserId) -> Result<Vec<PermissionPattern>> {
        let users = self.users.read().await;
        Ok(users
            .get(&user_id)
            .map(|u| u.permissions().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<PermissionPattern>> {
        let roles = self.roles.read().await;
        roles
            .get(&role_id)
            .map(|r| r.permissions().to_vec())
            .ok_or_else(|| LmsError::not_found(format!("role:{}", role_id)))
    }

    async fn find_role_by_name(&self, name: &RoleName) -> Result<Option<Role>> {
        let roles = self.roles.read().await;
        Ok(roles.values().find(|r| r.name() == name).cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let roles = self.roles.read().await;
        let mut list: Vec<Role> = roles.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(list)
    }

    async fn save_role(&self, role: &Role) -> Result<()> {
        let mut roles = self.roles.write().await;
        if roles
            .values()
            .any(|r| r.name() == role.name() && r.id() != role.id())
        {
            return Err(LmsError::Conflict {
                details: format!("role already exists: {}", role.name()),
            });
        }

        let previous_name = roles.get(&role.id()).map(|r| r.name().clone());
        let mut stored = role.clone();
        stored.take_events();
        roles.insert(role.id(), stored);
        drop(roles);

        // 角色按名称引用，重命名时同步到用户
        if let Some(previous) = previous_name.filter(|prev| prev != role.name()) {
            let mut users = self.users.write().await;
            for user in users.values_mut() {
                if user.remove_role(&previous) {
                    user.assign_role(role.name().clone());
                    user.take_events();
                }
            }
        }
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<()> {
        let removed = self
            .roles
            .write()
            .await
            .remove(&role_id)
            .ok_or_else(|| LmsError::not_found(format!("role:{}", role_id)))?;

        let mut users = self.users.write().await;
        for user in users.values_mut() {
            if user.remove_role(removed.name()) {
                user.take_events();
            }
        }
        Ok(())
    }
}

/// 基于内存的刷新令牌轮换存储，比较与更新在同一把锁内完成
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    rotations: Mutex<HashMap<UserId, String>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn current(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.rotations.lock().await.get(&user_id).cloned())
    }

    async fn store(&self, user_id: UserId, rotation_id: &str) -> Result<()> {
        self.rotations
            .lock()
            .await
            .insert(user_id, rotation_id.to_string());
        Ok(())
    }

    async fn compare_and_swap(&self, user_id: UserId, expected: &str, next: &str) -> Result<bool> {
        let mut rotations = self.rotations.lock().await;
        match rotations.get_mut(&user_id) {
            Some(current) if rotation_matches(current, expected) => {
                *current = next.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, user_id: UserId) -> Result<()> {
        self.rotations.lock().await.remove(&user_id);
        Ok(())
    }
}
