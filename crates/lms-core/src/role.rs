use std::fmt;

use chrono::{DateTime, Utc};
use lms_error::{LmsError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::DomainEvent;
use crate::permission::{is_valid_segment, PermissionPattern};

/// 保留的系统角色名
pub const ADMIN_ROLE: &str = "admin";

/// 角色名：`[a-z][a-z0-9_]*`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    pub fn parse(input: &str) -> Result<Self> {
        if !is_valid_segment(input) {
            return Err(LmsError::validation(
                "role",
                format!("invalid role name '{}'", input),
            ));
        }
        Ok(Self(input.to_string()))
    }

    pub fn admin() -> Self {
        Self(ADMIN_ROLE.to_string())
    }

    pub fn is_admin(&self) -> bool {
        self.0 == ADMIN_ROLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoleName {
    type Error = LmsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

/// 角色聚合
#[derive(Debug, Clone)]
pub struct Role {
    id: Uuid,
    name: RoleName,
    description: Option<String>,
    is_system: bool,
    permissions: Vec<PermissionPattern>,
    created_at: DateTime<Utc>,
    pending_events: Vec<DomainEvent>,
}

impl Role {
    /// 创建用户自定义角色；`admin` 只能作为系统角色存在
    pub fn new(name: RoleName, description: Option<String>) -> Result<Self> {
        if name.is_admin() {
            return Err(LmsError::SystemRoleProtected {
                role: name.to_string(),
                operation: "create".to_string(),
            });
        }
        Ok(Self::build(name, description, false))
    }

    /// 唯一的系统角色，默认持有全局权限
    pub fn system_admin() -> Self {
        let mut role = Self::build(
            RoleName::admin(),
            Some("System administrator".to_string()),
            true,
        );
        role.permissions.push(PermissionPattern::Global);
        role
    }

    fn build(name: RoleName, description: Option<String>, is_system: bool) -> Self {
        let now = Utc::now();
        let id = Uuid::now_v7();
        Self {
            id,
            name: name.clone(),
            description,
            is_system,
            permissions: Vec::new(),
            created_at: now,
            pending_events: vec![DomainEvent::RoleCreated {
                role_id: id,
                name: name.to_string(),
                at: now,
            }],
        }
    }

    /// 从存储中恢复
    pub fn restore(
        id: Uuid,
        name: RoleName,
        description: Option<String>,
        is_system: bool,
        permissions: Vec<PermissionPattern>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut role = Self {
            id,
            name,
            description,
            is_system,
            permissions: Vec::with_capacity(permissions.len()),
            created_at,
            pending_events: Vec::new(),
        };
        for permission in permissions {
            if !role.permissions.contains(&permission) {
                role.permissions.push(permission);
            }
        }
        role
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &RoleName {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn permissions(&self) -> &[PermissionPattern] {
        &self.permissions
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending_events
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn rename(&mut self, new_name: RoleName) -> Result<()> {
        if self.is_system {
            return Err(LmsError::SystemRoleProtected {
                role: self.name.to_string(),
                operation: "rename".to_string(),
            });
        }
        if new_name.is_admin() {
            return Err(LmsError::SystemRoleProtected {
                role: new_name.to_string(),
                operation: "rename".to_string(),
            });
        }
        if new_name == self.name {
            return Ok(());
        }
        let from = std::mem::replace(&mut self.name, new_name);
        self.pending_events.push(DomainEvent::RoleRenamed {
            role_id: self.id,
            from: from.to_string(),
            to: self.name.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn ensure_deletable(&self) -> Result<()> {
        if self.is_system {
            return Err(LmsError::SystemRoleProtected {
                role: self.name.to_string(),
                operation: "delete".to_string(),
            });
        }
        Ok(())
    }

    /// 授予权限，保持插入顺序并去重
    pub fn grant(&mut self, permission: PermissionPattern) -> bool {
        if self.permissions.contains(&permission) {
            return false;
        }
        self.pending_events.push(DomainEvent::RolePermissionGranted {
            role_id: self.id,
            permission: permission.to_string(),
            at: Utc::now(),
        });
        self.permissions.push(permission);
        true
    }

    pub fn revoke(&mut self, permission: &PermissionPattern) -> bool {
        let before = self.permissions.len();
        self.permissions.retain(|p| p != permission);
        if self.permissions.len() == before {
            return false;
        }
        self.pending_events.push(DomainEvent::RolePermissionRevoked {
            role_id: self.id,
            permission: permission.to_string(),
            at: Utc::now(),
        });
        true
    }
}
