/// 权限定义模块
/// 定义课程平台内置的权限键和默认角色

/// 权限常量定义
pub struct Permission;

impl Permission {
    // 课程
    pub const COURSES_READ: &'static str = "courses:read";
    pub const COURSES_CREATE: &'static str = "courses:create";
    pub const COURSES_UPDATE: &'static str = "courses:update";
    pub const COURSES_DELETE: &'static str = "courses:delete";
    pub const COURSES_PUBLISH: &'static str = "courses:publish";

    // 课时
    pub const LESSONS_READ: &'static str = "lessons:read";
    pub const LESSONS_WRITE: &'static str = "lessons:write";

    // 选课
    pub const ENROLLMENTS_READ: &'static str = "enrollments:read";
    pub const ENROLLMENTS_CREATE: &'static str = "enrollments:create";
    pub const ENROLLMENTS_MANAGE: &'static str = "enrollments:manage";

    // 用户管理
    pub const USERS_READ: &'static str = "users:read";
    pub const USERS_MANAGE: &'static str = "users:manage";

    // 角色管理
    pub const ROLES_READ: &'static str = "roles:read";
    pub const ROLES_MANAGE: &'static str = "roles:manage";

    pub fn all() -> Vec<&'static str> {
        vec![
            Self::COURSES_READ,
            Self::COURSES_CREATE,
            Self::COURSES_UPDATE,
            Self::COURSES_DELETE,
            Self::COURSES_PUBLISH,
            Self::LESSONS_READ,
            Self::LESSONS_WRITE,
            Self::ENROLLMENTS_READ,
            Self::ENROLLMENTS_CREATE,
            Self::ENROLLMENTS_MANAGE,
            Self::USERS_READ,
            Self::USERS_MANAGE,
            Self::ROLES_READ,
            Self::ROLES_MANAGE,
        ]
    }
}

/// 系统内置角色
pub struct SystemRole;

impl SystemRole {
    pub const ADMIN: &'static str = lms_core::ADMIN_ROLE;
    pub const INSTRUCTOR: &'static str = "instructor";
    pub const STUDENT: &'static str = "student";

    /// 获取角色的默认权限；admin 持有全局通配符
    pub fn get_default_permissions(role: &str) -> Vec<&'static str> {
        match role {
            Self::ADMIN => vec![lms_core::WILDCARD],
            Self::INSTRUCTOR => vec![
                "courses:*",
                "lessons:*",
                Permission::ENROLLMENTS_READ,
                Permission::ENROLLMENTS_MANAGE,
                Permission::USERS_READ,
            ],
            Self::STUDENT => vec![
                Permission::COURSES_READ,
                Permission::LESSONS_READ,
                Permission::ENROLLMENTS_READ,
                Permission::ENROLLMENTS_CREATE,
            ],
            _ => vec![],
        }
    }

    pub fn all() -> Vec<&'static str> {
        vec![Self::ADMIN, Self::INSTRUCTOR, Self::STUDENT]
    }

    /// 新注册用户的默认角色
    pub fn default_for_new_users() -> &'static str {
        Self::STUDENT
    }
}

/// 权限分组，用于管理界面展示
#[derive(Debug, Clone, serde::Serialize)]
pub struct PermissionGroup {
    pub name: &'static str,
    pub description: &'static str,
    pub permissions: Vec<&'static str>,
}

impl PermissionGroup {
    pub fn all_groups() -> Vec<PermissionGroup> {
        vec![
            PermissionGroup {
                name: "courses",
                description: "课程管理",
                permissions: vec![
                    Permission::COURSES_READ,
                    Permission::COURSES_CREATE,
                    Permission::COURSES_UPDATE,
                    Permission::COURSES_DELETE,
                    Permission::COURSES_PUBLISH,
                ],
            },
            PermissionGroup {
                name: "lessons",
                description: "课时管理",
                permissions: vec![Permission::LESSONS_READ, Permission::LESSONS_WRITE],
            },
            PermissionGroup {
                name: "enrollments",
                description: "选课管理",
                permissions: vec![
                    Permission::ENROLLMENTS_READ,
                    Permission::ENROLLMENTS_CREATE,
                    Permission::ENROLLMENTS_MANAGE,
                ],
            },
            PermissionGroup {
                name: "users",
                description: "用户管理",
                permissions: vec![Permission::USERS_READ, Permission::USERS_MANAGE],
            },
            PermissionGroup {
                name: "roles",
                description: "角色管理",
                permissions: vec![Permission::ROLES_READ, Permission::ROLES_MANAGE],
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_core::PermissionPattern;

    #[test]
    fn test_all_permission_keys_are_well_formed() {
        for key in Permission::all() {
            assert!(PermissionPattern::parse(key).is_ok(), "{}", key);
        }
        for role in SystemRole::all() {
            for key in SystemRole::get_default_permissions(role) {
                assert!(PermissionPattern::parse(key).is_ok(), "{}", key);
            }
        }
    }

    #[test]
    fn test_groups_cover_every_permission() {
        let grouped: Vec<&str> = PermissionGroup::all_groups()
            .into_iter()
            .flat_map(|g| g.permissions)
            .collect();
        for key in Permission::all() {
            assert!(grouped.contains(&key), "{}", key);
        }
    }

    #[test]
    fn test_admin_holds_global_wildcard() {
        assert_eq!(SystemRole::get_default_permissions(SystemRole::ADMIN), vec!["*"]);
        assert!(SystemRole::get_default_permissions("unknown").is_empty());
    }
}
