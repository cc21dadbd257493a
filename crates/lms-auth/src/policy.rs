//! 管理员不能对自己执行的操作，与角色检查相互独立

use lms_core::{RoleName, UserId};
use lms_error::{LmsError, Result};

pub fn ensure_not_self_deactivation(actor: UserId, target: UserId) -> Result<()> {
    forbid_self(actor, target, "cannot deactivate own account")
}

pub fn ensure_not_removing_own_admin(actor: UserId, target: UserId, role: &RoleName) -> Result<()> {
    if role.is_admin() {
        forbid_self(actor, target, "cannot remove own admin role")
    } else {
        Ok(())
    }
}

pub fn ensure_not_modifying_own_permissions(actor: UserId, target: UserId) -> Result<()> {
    forbid_self(actor, target, "cannot modify own permissions")
}

fn forbid_self(actor: UserId, target: UserId, message: &str) -> Result<()> {
    if actor == target {
        tracing::warn!(user_id = %actor, "{}", message);
        return Err(LmsError::SelfActionForbidden {
            message: message.to_string(),
        });
    }
    Ok(())
}
