pub mod events;
pub mod identity;
pub mod permission;
pub mod role;

pub use events::{DomainEvent, PermissionImpact};
pub use identity::{Email, IdentitySnapshot, PasswordHash, UserId, UserIdentity};
pub use permission::{EffectivePermissionSet, PermissionPattern, WILDCARD};
pub use role::{Role, RoleName, ADMIN_ROLE};

pub use lms_error::{LmsError as Error, Result};
