use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::UserId;

/// 聚合根在变更时记录的领域事件
///
/// 每个聚合自己持有 `pending_events`，由用例在持久化之后取出并发布。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    UserRegistered {
        user_id: UserId,
        email: String,
        at: DateTime<Utc>,
    },
    UserProfileUpdated {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    PasswordChanged {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    UserActivated {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    UserDeactivated {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    RoleAssigned {
        user_id: UserId,
        role: String,
        at: DateTime<Utc>,
    },
    RoleRemoved {
        user_id: UserId,
        role: String,
        at: DateTime<Utc>,
    },
    UserPermissionsChanged {
        user_id: UserId,
        permissions: Vec<String>,
        at: DateTime<Utc>,
    },
    RoleCreated {
        role_id: Uuid,
        name: String,
        at: DateTime<Utc>,
    },
    RoleRenamed {
        role_id: Uuid,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    RolePermissionGranted {
        role_id: Uuid,
        permission: String,
        at: DateTime<Utc>,
    },
    RolePermissionRevoked {
        role_id: Uuid,
        permission: String,
        at: DateTime<Utc>,
    },
}

/// 事件对权限缓存的影响范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionImpact {
    None,
    User(UserId),
    AllUsers,
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserRegistered { .. } => "user_registered",
            DomainEvent::UserProfileUpdated { .. } => "user_profile_updated",
            DomainEvent::PasswordChanged { .. } => "password_changed",
            DomainEvent::UserActivated { .. } => "user_activated",
            DomainEvent::UserDeactivated { .. } => "user_deactivated",
            DomainEvent::RoleAssigned { .. } => "role_assigned",
            DomainEvent::RoleRemoved { .. } => "role_removed",
            DomainEvent::UserPermissionsChanged { .. } => "user_permissions_changed",
            DomainEvent::RoleCreated { .. } => "role_created",
            DomainEvent::RoleRenamed { .. } => "role_renamed",
            DomainEvent::RolePermissionGranted { .. } => "role_permission_granted",
            DomainEvent::RolePermissionRevoked { .. } => "role_permission_revoked",
        }
    }

    pub fn permission_impact(&self) -> PermissionImpact {
        match self {
            DomainEvent::RoleAssigned { user_id, .. }
            | DomainEvent::RoleRemoved { user_id, .. }
            | DomainEvent::UserPermissionsChanged { user_id, .. }
            | DomainEvent::UserDeactivated { user_id, .. }
            | DomainEvent::UserActivated { user_id, .. } => PermissionImpact::User(*user_id),
            DomainEvent::RoleRenamed { .. }
            | DomainEvent::RolePermissionGranted { .. }
            | DomainEvent::RolePermissionRevoked { .. } => PermissionImpact::AllUsers,
            DomainEvent::UserRegistered { .. }
            | DomainEvent::UserProfileUpdated { .. }
            | DomainEvent::PasswordChanged { .. }
            | DomainEvent::RoleCreated { .. } => PermissionImpact::None,
        }
    }
}
