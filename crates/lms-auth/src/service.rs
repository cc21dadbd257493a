use std::sync::Arc;

use lms_core::{Email, RoleName, UserId, UserIdentity};
use lms_error::{LmsError, Result};

use crate::jwt::{TokenPair, TokenService};
use crate::models::UserInfo;
use crate::password::PasswordService;
use crate::permissions::SystemRole;
use crate::rbac::{dispatch_events, PermissionCheck};
use crate::repository::{IdentityRepository, RefreshTokenStore, RolePermissionRepository};

/// 认证用例：注册、登录、刷新、登出
#[derive(Clone)]
pub struct AuthService {
    identities: Arc<dyn IdentityRepository>,
    roles: Arc<dyn RolePermissionRepository>,
    tokens: Arc<TokenService>,
    refresh_store: Arc<dyn RefreshTokenStore>,
    permissions: Arc<dyn PermissionCheck>,
}

fn invalid_credentials() -> LmsError {
    LmsError::AuthenticationRequired {
        message: "邮箱或密码错误".to_string(),
    }
}

/// bcrypt 是 CPU 密集操作，放到阻塞线程池执行
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| LmsError::Internal {
            message: format!("blocking task failed: {}", e),
            details: None,
        })?
}

impl AuthService {
    pub fn new(
        identities: Arc<dyn IdentityRepository>,
        roles: Arc<dyn RolePermissionRepository>,
        tokens: Arc<TokenService>,
        refresh_store: Arc<dyn RefreshTokenStore>,
        permissions: Arc<dyn PermissionCheck>,
    ) -> Self {
        Self {
            identities,
            roles,
            tokens,
            refresh_store,
            permissions,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// 注册新用户；存在 student 角色时自动分配
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<String>,
    ) -> Result<UserIdentity> {
        let email = Email::parse(email)?;
        PasswordService::validate_password_strength(password)?;

        if self.identities.exists_by_email(&email).await? {
            return Err(LmsError::Conflict {
                details: format!("email already registered: {}", email),
            });
        }

        let password = password.to_string();
        let hash = run_blocking(move || PasswordService::hash_unchecked(&password)).await?;
        let mut identity = UserIdentity::register(email, hash, display_name);

        let default_role = RoleName::parse(SystemRole::default_for_new_users())?;
        if self.roles.find_role_by_name(&default_role).await?.is_some() {
            identity.assign_role(default_role);
        }

        self.identities.save(&identity).await?;
        tracing::info!(user_id = %identity.id(), email = %identity.email(), "user registered");
        dispatch_events(self.permissions.as_ref(), identity.take_events()).await;
        Ok(identity)
    }

    /// 邮箱密码登录，签发新的令牌族
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let email = Email::parse(email).map_err(|_| invalid_credentials())?;
        let Some(identity) = self.identities.find_by_email(&email).await? else {
            tracing::info!(email = %email, "login failed: unknown email");
            return Err(invalid_credentials());
        };

        let presented = password.to_string();
        let stored = identity.password().clone();
        let verified =
            run_blocking(move || PasswordService::verify_password(&presented, &stored)).await?;
        if !verified {
            tracing::info!(user_id = %identity.id(), "login failed: wrong password");
            return Err(invalid_credentials());
        }
        if !identity.is_active() {
            tracing::warn!(user_id = %identity.id(), "login rejected: account deactivated");
            return Err(LmsError::InvalidSession {
                message: "账户已停用".to_string(),
            });
        }

        let pair = self.tokens.issue_token_pair(&identity)?;
        self.refresh_store
            .store(identity.id(), &pair.refresh.rotation_id)
            .await?;
        tracing::info!(user_id = %identity.id(), "user logged in");
        Ok(pair)
    }

    /// 轮换刷新令牌；旧令牌重放或并发竞争失败都会吊销整个令牌族
    ///
    /// 同一令牌并发刷新时只有一方成功，但失败方随后吊销整个族，
    /// 成功方拿到的新刷新令牌也会失效，客户端需重新登录。
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.tokens.decode_refresh_token(refresh_token)?;
        let user_id = claims.user_id()?;

        let Some(current) = self.refresh_store.current(user_id).await? else {
            tracing::warn!(user_id = %user_id, "refresh attempted on revoked token family");
            return Err(LmsError::TokenRotationMismatch);
        };
        if let Err(e) = self.tokens.validate_refresh_token(refresh_token, &current) {
            if matches!(e, LmsError::TokenRotationMismatch) {
                tracing::warn!(user_id = %user_id, "refresh token reuse detected, revoking family");
                self.refresh_store.revoke(user_id).await?;
            }
            return Err(e);
        }

        let identity = match self.identities.find_by_id(user_id).await? {
            Some(identity) if identity.is_active() => identity,
            _ => {
                self.refresh_store.revoke(user_id).await?;
                return Err(LmsError::InvalidSession {
                    message: "账户不存在或已停用".to_string(),
                });
            }
        };

        let pair = self.tokens.issue_token_pair(&identity)?;
        let swapped = self
            .refresh_store
            .compare_and_swap(user_id, &current, &pair.refresh.rotation_id)
            .await?;
        if !swapped {
            tracing::warn!(user_id = %user_id, "concurrent refresh lost rotation race, revoking family");
            self.refresh_store.revoke(user_id).await?;
            return Err(LmsError::TokenRotationMismatch);
        }

        tracing::debug!(user_id = %user_id, "refresh token rotated");
        Ok(pair)
    }

    /// 吊销用户的令牌族
    pub async fn logout(&self, user_id: UserId) -> Result<()> {
        self.refresh_store.revoke(user_id).await?;
        tracing::info!(user_id = %user_id, "user logged out");
        Ok(())
    }

    async fn load_user(&self, user_id: UserId) -> Result<UserIdentity> {
        self.identities
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| LmsError::not_found(format!("user:{}", user_id)))
    }

    pub async fn me(&self, user_id: UserId) -> Result<UserInfo> {
        let identity = self.load_user(user_id).await?;
        let permissions = self.permissions.get_effective_permissions(user_id).await?;
        Ok(UserInfo::new(&identity, permissions.to_sorted_strings()))
    }

    /// 更新邮箱或显示名称，新邮箱不能被其他账户占用
    pub async fn update_profile(
        &self,
        user_id: UserId,
        email: Option<&str>,
        display_name: Option<String>,
    ) -> Result<UserInfo> {
        let email = email.map(Email::parse).transpose()?;
        let mut identity = self.load_user(user_id).await?;

        if let Some(email) = email.as_ref().filter(|e| *e != identity.email()) {
            if self.identities.exists_by_email(email).await? {
                return Err(LmsError::Conflict {
                    details: format!("email already registered: {}", email),
                });
            }
        }

        identity.update_profile(email, display_name);
        self.identities.save(&identity).await?;
        tracing::info!(user_id = %user_id, "profile updated");
        dispatch_events(self.permissions.as_ref(), identity.take_events()).await;
        self.me(user_id).await
    }

    /// 校验当前密码后设置新密码，并吊销令牌族
    pub async fn change_password(
        &self,
        user_id: UserId,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let mut identity = self.load_user(user_id).await?;

        let presented = current_password.to_string();
        let stored = identity.password().clone();
        let verified =
            run_blocking(move || PasswordService::verify_password(&presented, &stored)).await?;
        if !verified {
            tracing::info!(user_id = %user_id, "password change rejected: wrong current password");
            return Err(LmsError::validation("current_password", "当前密码不正确"));
        }

        let next = new_password.to_string();
        let hash = run_blocking(move || PasswordService::hash_password(&next)).await?;
        identity.change_password(hash);
        self.identities.save(&identity).await?;
        self.refresh_store.revoke(user_id).await?;
        tracing::info!(user_id = %user_id, "password changed");
        dispatch_events(self.permissions.as_ref(), identity.take_events()).await;
        Ok(())
    }
}
