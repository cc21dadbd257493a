//! Postgres 持久化实现，表结构见 deployments/migrations/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lms_core::{
    Email, IdentitySnapshot, PasswordHash, PermissionPattern, Role, RoleName, UserId, UserIdentity,
};
use lms_error::{LmsError, Result};
use sqlx::{
    migrate::Migrator,
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};
use uuid::Uuid;

use crate::repository::{IdentityRepository, RefreshTokenStore, RolePermissionRepository};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../deployments/migrations");

/// 建立连接池并执行迁移
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| LmsError::database("connect", e))?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| LmsError::database("migrate", e))?;
    tracing::info!("postgres migrations applied");
    Ok(pool)
}

fn write_error(operation: &str, e: sqlx::Error, conflict: impl FnOnce() -> String) -> LmsError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => LmsError::Conflict {
            details: conflict(),
        },
        _ => LmsError::database(operation, e),
    }
}

fn parse_patterns(values: Vec<String>) -> Result<Vec<PermissionPattern>> {
    values
        .iter()
        .map(|value| {
            PermissionPattern::parse(value).map_err(|e| LmsError::Serialization {
                format: "jsonb".to_string(),
                message: format!("stored permission '{}' is invalid: {}", value, e),
            })
        })
        .collect()
}

fn pattern_strings<'a>(patterns: impl Iterator<Item = &'a PermissionPattern>) -> Json<Vec<String>> {
    Json(patterns.map(ToString::to_string).collect())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| LmsError::database(&format!("decode {}", name), e))
}

fn role_from_row(row: &PgRow) -> Result<Role> {
    let name: String = column(row, "name")?;
    let permissions: Json<Vec<String>> = column(row, "permissions")?;
    Ok(Role::restore(
        column(row, "id")?,
        RoleName::parse(&name)?,
        column(row, "description")?,
        column(row, "is_system")?,
        parse_patterns(permissions.0)?,
        column(row, "created_at")?,
    ))
}

/// 用户身份仓储
#[derive(Clone)]
pub struct PgIdentityRepository {
    pool: PgPool,
}

impl PgIdentityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: PgRow) -> Result<UserIdentity> {
        let id: Uuid = column(&row, "id")?;
        let role_rows = sqlx::query(
            r#"
            SELECT r.name
            FROM roles r
            JOIN user_roles ur ON r.id = ur.role_id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LmsError::database("load_user_roles", e))?;

        let roles = role_rows
            .iter()
            .map(|r| column::<String>(r, "name").and_then(|name| RoleName::parse(&name)))
            .collect::<Result<Vec<_>>>()?;

        let email: String = column(&row, "email")?;
        let password_hash: String = column(&row, "password_hash")?;
        let permissions: Json<Vec<String>> = column(&row, "permissions")?;
        let created_at: DateTime<Utc> = column(&row, "created_at")?;
        let updated_at: DateTime<Utc> = column(&row, "updated_at")?;

        Ok(UserIdentity::restore(IdentitySnapshot {
            id: UserId::from_uuid(id),
            email: Email::parse(&email)?,
            password: PasswordHash::from_hash(password_hash),
            display_name: column(&row, "display_name")?,
            active: column(&row, "is_active")?,
            roles,
            permissions: parse_patterns(permissions.0)?,
            created_at,
            updated_at,
        }))
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, display_name, is_active, permissions, created_at, updated_at";

#[async_trait]
impl IdentityRepository for PgIdentityRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserIdentity>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LmsError::database("find_user_by_id", e))?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_email(&self, email: &Email) -> Result<Option<UserIdentity>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
            .bind(email.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LmsError::database("find_user_by_email", e))?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn exists_by_email(&self, email: &Email) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1) AS present")
            .bind(email.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LmsError::database("exists_by_email", e))?;
        column(&row, "present")
    }

    async fn save(&self, identity: &UserIdentity) -> Result<()> {
        let id = identity.id().as_uuid();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LmsError::database("begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, display_name, is_active, permissions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                email = EXCLUDED.email,
                password_hash = EXCLUDED.password_hash,
                display_name = EXCLUDED.display_name,
                is_active = EXCLUDED.is_active,
                permissions = EXCLUDED.permissions,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id)
        .bind(identity.email().as_str())
        .bind(identity.password().as_str())
        .bind(identity.display_name())
        .bind(identity.is_active())
        .bind(pattern_strings(identity.permissions()))
        .bind(identity.created_at())
        .bind(identity.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            write_error("save_user", e, || {
                format!("email already registered: {}", identity.email())
            })
        })?;

        sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| LmsError::database("clear_user_roles", e))?;

        let role_names: Vec<String> = identity.role_names();
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&role_names)
        .execute(&mut *tx)
        .await
        .map_err(|e| LmsError::database("save_user_roles", e))?;

        tx.commit()
            .await
            .map_err(|e| LmsError::database("commit", e))
    }
}

/// 角色/权限仓储，角色权限以 JSON 数组保存
#[derive(Clone)]
pub struct PgRolePermissionRepository {
    pool: PgPool,
}

impl PgRolePermissionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RolePermissionRepository for PgRolePermissionRepository {
    async fn find_roles_for_user(&self, user_id: UserId) -> Result<Vec<Role>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.name, r.description, r.is_system, r.permissions, r.created_at
            FROM roles r
            JOIN user_roles ur ON r.id = ur.role_id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LmsError::database("find_roles_for_user", e))?;

        rows.iter().map(role_from_row).collect()
    }

    async fn find_permissions_for_user(&self, user_id: UserId) -> Result<Vec<PermissionPattern>> {
        let row = sqlx::query("SELECT permissions FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LmsError::database("find_permissions_for_user", e))?;
        match row {
            Some(row) => {
                let permissions: Json<Vec<String>> = column(&row, "permissions")?;
                parse_patterns(permissions.0)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<PermissionPattern>> {
        let row = sqlx::query("SELECT permissions FROM roles WHERE id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LmsError::database("find_permissions_for_role", e))?
            .ok_or_else(|| LmsError::not_found(format!("role:{}", role_id)))?;
        let permissions: Json<Vec<String>> = column(&row, "permissions")?;
        parse_patterns(permissions.0)
    }

    async fn find_role_by_name(&self, name: &RoleName) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT id, name, description, is_system, permissions, created_at FROM roles WHERE name = $1",
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LmsError::database("find_role_by_name", e))?;
        row.as_ref().map(role_from_row).transpose()
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows = sqlx::query(
            "SELECT id, name, description, is_system, permissions, created_at FROM roles ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LmsError::database("list_roles", e))?;
        rows.iter().map(role_from_row).collect()
    }

    async fn save_role(&self, role: &Role) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, name, description, is_system, permissions, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                permissions = EXCLUDED.permissions
            "#,
        )
        .bind(role.id())
        .bind(role.name().as_str())
        .bind(role.description())
        .bind(role.is_system())
        .bind(pattern_strings(role.permissions().iter()))
        .bind(role.created_at())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("save_role", e, || format!("role already exists: {}", role.name())))?;
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await
            .map_err(|e| LmsError::database("delete_role", e))?;
        if result.rows_affected() == 0 {
            return Err(LmsError::not_found(format!("role:{}", role_id)));
        }
        Ok(())
    }
}

/// 刷新令牌轮换存储，比较与更新由单条 UPDATE 原子完成
#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn current(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT rotation_id FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LmsError::database("current_rotation", e))?;
        row.as_ref().map(|r| column(r, "rotation_id")).transpose()
    }

    async fn store(&self, user_id: UserId, rotation_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (user_id, rotation_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (user_id) DO UPDATE SET
                rotation_id = EXCLUDED.rotation_id,
                updated_at = now()
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(rotation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LmsError::database("store_rotation", e))?;
        Ok(())
    }

    async fn compare_and_swap(&self, user_id: UserId, expected: &str, next: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET rotation_id = $3, updated_at = now()
            WHERE user_id = $1 AND rotation_id = $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(|e| LmsError::database("rotate_refresh_token", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke(&self, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| LmsError::database("revoke_refresh_tokens", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_patterns_rejects_corrupt_rows() {
        let ok = parse_patterns(vec!["courses:*".to_string(), "*".to_string()]).unwrap();
        assert_eq!(ok.len(), 2);
        let err = parse_patterns(vec!["*:read".to_string()]).unwrap_err();
        assert!(matches!(err, LmsError::Serialization { .. }));
    }

    #[test]
    fn test_pattern_strings() {
        let patterns = [PermissionPattern::Global, PermissionPattern::parse("a:b").unwrap()];
        let Json(strings) = pattern_strings(patterns.iter());
        assert_eq!(strings, vec!["*".to_string(), "a:b".to_string()]);
    }
}
