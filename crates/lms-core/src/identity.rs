use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lms_error::{LmsError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::DomainEvent;
use crate::permission::PermissionPattern;
use crate::role::RoleName;

/// 用户ID（UUID v7，按时间有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(input: &str) -> Result<Self> {
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| LmsError::validation("user_id", e.to_string()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = LmsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// 规范化后的邮箱地址（小写）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    const MAX_LEN: usize = 254;
    const MAX_LOCAL_LEN: usize = 64;

    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().to_lowercase();
        let invalid = |message: &str| LmsError::validation("email", message.to_string());

        if normalized.is_empty() || normalized.len() > Self::MAX_LEN {
            return Err(invalid("邮箱长度无效"));
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(invalid("邮箱不能包含空白字符"));
        }

        let (local, domain) = normalized
            .split_once('@')
            .ok_or_else(|| invalid("邮箱缺少@"))?;

        if local.is_empty() || local.len() > Self::MAX_LOCAL_LEN || domain.contains('@') {
            return Err(invalid("邮箱本地部分无效"));
        }
        if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
            return Err(invalid("邮箱本地部分无效"));
        }
        if !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+/=?^_`{|}~.-".contains(c))
        {
            return Err(invalid("邮箱本地部分包含非法字符"));
        }

        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 {
            return Err(invalid("邮箱域名无效"));
        }
        let labels_ok = labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
        if !labels_ok {
            return Err(invalid("邮箱域名无效"));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Email {
    type Error = LmsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

/// 不透明的密码哈希，永远不保存明文
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(***)")
    }
}

/// 用户身份聚合
#[derive(Debug, Clone)]
pub struct UserIdentity {
    id: UserId,
    email: Email,
    password: PasswordHash,
    display_name: Option<String>,
    active: bool,
    roles: BTreeSet<RoleName>,
    permissions: BTreeSet<PermissionPattern>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pending_events: Vec<DomainEvent>,
}

/// 从存储中恢复身份时使用的快照
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    pub id: UserId,
    pub email: Email,
    pub password: PasswordHash,
    pub display_name: Option<String>,
    pub active: bool,
    pub roles: Vec<RoleName>,
    pub permissions: Vec<PermissionPattern>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserIdentity {
    /// 注册新用户，记录 `UserRegistered`
    pub fn register(email: Email, password: PasswordHash, display_name: Option<String>) -> Self {
        let now = Utc::now();
        let id = UserId::new();
        let mut identity = Self {
            id,
            email: email.clone(),
            password,
            display_name,
            active: true,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            pending_events: Vec::new(),
        };
        identity.pending_events.push(DomainEvent::UserRegistered {
            user_id: id,
            email: email.to_string(),
            at: now,
        });
        identity
    }

    pub fn restore(snapshot: IdentitySnapshot) -> Self {
        Self {
            id: snapshot.id,
            email: snapshot.email,
            password: snapshot.password,
            display_name: snapshot.display_name,
            active: snapshot.active,
            roles: snapshot.roles.into_iter().collect(),
            permissions: snapshot.permissions.into_iter().collect(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn email(&self) -> &Email {
        &self.email
    }

    pub fn password(&self) -> &PasswordHash {
        &self.password
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleName> {
        self.roles.iter()
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.as_str().to_string()).collect()
    }

    pub fn has_role(&self, role: &RoleName) -> bool {
        self.roles.contains(role)
    }

    pub fn permissions(&self) -> impl Iterator<Item = &PermissionPattern> {
        self.permissions.iter()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending_events
    }

    /// 取出并清空待发布事件
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn touch(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.updated_at = now;
        now
    }

    pub fn update_profile(&mut self, email: Option<Email>, display_name: Option<String>) {
        if let Some(email) = email {
            self.email = email;
        }
        if display_name.is_some() {
            self.display_name = display_name;
        }
        let at = self.touch();
        self.pending_events.push(DomainEvent::UserProfileUpdated {
            user_id: self.id,
            at,
        });
    }

    pub fn change_password(&mut self, password: PasswordHash) {
        self.password = password;
        let at = self.touch();
        self.pending_events
            .push(DomainEvent::PasswordChanged { user_id: self.id, at });
    }

    /// 停用账户；已停用时返回 false 且不记录事件
    pub fn deactivate(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        let at = self.touch();
        self.pending_events
            .push(DomainEvent::UserDeactivated { user_id: self.id, at });
        true
    }

    pub fn activate(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        let at = self.touch();
        self.pending_events
            .push(DomainEvent::UserActivated { user_id: self.id, at });
        true
    }

    pub fn assign_role(&mut self, role: RoleName) -> bool {
        if !self.roles.insert(role.clone()) {
            return false;
        }
        let at = self.touch();
        self.pending_events.push(DomainEvent::RoleAssigned {
            user_id: self.id,
            role: role.to_string(),
            at,
        });
        true
    }

    pub fn remove_role(&mut self, role: &RoleName) -> bool {
        if !self.roles.remove(role) {
            return false;
        }
        let at = self.touch();
        self.pending_events.push(DomainEvent::RoleRemoved {
            user_id: self.id,
            role: role.to_string(),
            at,
        });
        true
    }

    /// 整体替换个人权限集合
    pub fn set_permissions<I>(&mut self, permissions: I)
    where
        I: IntoIterator<Item = PermissionPattern>,
    {
        self.permissions = permissions.into_iter().collect();
        let at = self.touch();
        self.pending_events.push(DomainEvent::UserPermissionsChanged {
            user_id: self.id,
            permissions: self.permissions.iter().map(ToString::to_string).collect(),
            at,
        });
    }
}
