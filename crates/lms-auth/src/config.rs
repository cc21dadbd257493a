use lms_error::{LmsError, Result};
use serde::{Deserialize, Serialize};

/// 令牌签发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 签名密钥，只从环境变量注入
    #[serde(skip_serializing)]
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "lms-auth".to_string(),
            audience: "lms-api".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 7,
        }
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// 用环境变量覆盖已有配置（YAML 中不保存密钥）：
    /// JWT_SECRET（必填）、JWT_ACCESS_TTL_MINUTES、JWT_REFRESH_TTL_DAYS
    pub fn apply_env(&mut self) -> Result<()> {
        self.secret = std::env::var("JWT_SECRET").map_err(|_| LmsError::Configuration {
            key: "JWT_SECRET".to_string(),
            reason: "not set".to_string(),
        })?;

        if let Ok(value) = std::env::var("JWT_ACCESS_TTL_MINUTES") {
            self.access_ttl_minutes = parse_env_i64("JWT_ACCESS_TTL_MINUTES", &value)?;
        }
        if let Ok(value) = std::env::var("JWT_REFRESH_TTL_DAYS") {
            self.refresh_ttl_days = parse_env_i64("JWT_REFRESH_TTL_DAYS", &value)?;
        }
        Ok(())
    }

    /// 校验配置；缺少签名密钥视为签发失败（致命错误）
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(LmsError::TokenIssuance {
                message: "signing secret is not configured".to_string(),
            });
        }
        if self.secret.len() < 32 {
            tracing::warn!("JWT secret is shorter than recommended (32 bytes)");
        }
        check_ttl("access_ttl_minutes", self.access_ttl_minutes, MAX_ACCESS_TTL_MINUTES)?;
        check_ttl("refresh_ttl_days", self.refresh_ttl_days, MAX_REFRESH_TTL_DAYS)?;
        Ok(())
    }
}

/// 访问令牌最长 24 小时
pub const MAX_ACCESS_TTL_MINUTES: i64 = 24 * 60;
/// 刷新令牌最长 365 天
pub const MAX_REFRESH_TTL_DAYS: i64 = 365;

fn check_ttl(key: &str, value: i64, max: i64) -> Result<()> {
    if value <= 0 {
        return Err(LmsError::Configuration {
            key: key.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if value > max {
        return Err(LmsError::Configuration {
            key: key.to_string(),
            reason: format!("must not exceed {}", max),
        });
    }
    Ok(())
}

fn parse_env_i64(key: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| LmsError::Configuration {
        key: key.to_string(),
        reason: "must be a valid integer".to_string(),
    })
}
