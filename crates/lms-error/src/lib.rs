use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LmsError {
    // === 认证错误 ===
    #[error("需要认证: {message}")]
    AuthenticationRequired { message: String },

    #[error("会话无效: {message}")]
    InvalidSession { message: String },

    #[error("Token已过期")]
    TokenExpired,

    #[error("Token格式错误: {reason}")]
    TokenMalformed { reason: String },

    #[error("Token签名无效")]
    TokenInvalidSignature,

    #[error("刷新令牌轮换不匹配")]
    TokenRotationMismatch,

    // === 授权错误 ===
    #[error("权限不足: {required}")]
    InsufficientPermissions { required: String },

    #[error("禁止对自身执行此操作: {message}")]
    SelfActionForbidden { message: String },

    // === 业务错误 ===
    #[error("验证失败: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("系统角色受保护: {role} 不允许 {operation}")]
    SystemRoleProtected { role: String, operation: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("资源冲突: {details}")]
    Conflict { details: String },

    // === 基础设施错误 ===
    #[error("权限查询失败: {message}")]
    PermissionLookupFailed { message: String },

    #[error("Token签发失败: {message}")]
    TokenIssuance { message: String },

    #[error("数据库错误: {operation}")]
    Database { operation: String, message: String },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 认证/授权失败
    High,     // 依赖故障
    Critical, // 配置或签名密钥错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl LmsError {
    /// 字段校验失败的便捷构造
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        LmsError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        LmsError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        LmsError::Database {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LmsError::Validation { .. }
            | LmsError::NotFound { .. }
            | LmsError::Conflict { .. }
            | LmsError::SystemRoleProtected { .. } => ErrorSeverity::Low,
            LmsError::AuthenticationRequired { .. }
            | LmsError::InvalidSession { .. }
            | LmsError::TokenExpired
            | LmsError::TokenMalformed { .. }
            | LmsError::TokenInvalidSignature
            | LmsError::TokenRotationMismatch
            | LmsError::InsufficientPermissions { .. }
            | LmsError::SelfActionForbidden { .. } => ErrorSeverity::Medium,
            LmsError::PermissionLookupFailed { .. }
            | LmsError::Database { .. }
            | LmsError::Serialization { .. } => ErrorSeverity::High,
            LmsError::TokenIssuance { .. }
            | LmsError::Configuration { .. }
            | LmsError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误（重试策略由调用方负责）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LmsError::PermissionLookupFailed { .. } | LmsError::Database { .. }
        )
    }

    /// 稳定的错误码，用于响应体和日志
    pub fn code(&self) -> &'static str {
        match self {
            LmsError::AuthenticationRequired { .. } => "authentication_required",
            LmsError::InvalidSession { .. } => "invalid_session",
            LmsError::TokenExpired => "token_expired",
            LmsError::TokenMalformed { .. } => "token_malformed",
            LmsError::TokenInvalidSignature => "token_invalid_signature",
            LmsError::TokenRotationMismatch => "token_rotation_mismatch",
            LmsError::InsufficientPermissions { .. } => "insufficient_permissions",
            LmsError::SelfActionForbidden { .. } => "self_action_forbidden",
            LmsError::Validation { .. } => "validation_failed",
            LmsError::SystemRoleProtected { .. } => "system_role_protected",
            LmsError::NotFound { .. } => "not_found",
            LmsError::Conflict { .. } => "conflict",
            LmsError::PermissionLookupFailed { .. } => "permission_lookup_failed",
            LmsError::TokenIssuance { .. } => "token_issuance_failed",
            LmsError::Database { .. } => "database_error",
            LmsError::Configuration { .. } => "configuration_error",
            LmsError::Serialization { .. } => "serialization_error",
            LmsError::Internal { .. } => "internal_error",
        }
    }

    /// 是否属于认证失败（401）
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            LmsError::AuthenticationRequired { .. }
                | LmsError::InvalidSession { .. }
                | LmsError::TokenExpired
                | LmsError::TokenMalformed { .. }
                | LmsError::TokenInvalidSignature
                | LmsError::TokenRotationMismatch
        )
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    request_id = ?metadata.request_id,
                    code = self.code(),
                    error = %self,
                    "request rejected"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    request_id = ?metadata.request_id,
                    code = self.code(),
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "operational error"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            e if e.is_authentication_failure() => 401,
            LmsError::InsufficientPermissions { .. } | LmsError::SelfActionForbidden { .. } => 403,
            LmsError::Validation { .. } | LmsError::SystemRoleProtected { .. } => 400,
            LmsError::NotFound { .. } => 404,
            LmsError::Conflict { .. } => 409,
            LmsError::PermissionLookupFailed { .. } | LmsError::Database { .. } => 503,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息，不包含内部细节
    pub fn user_message(&self) -> String {
        match self {
            LmsError::AuthenticationRequired { .. } => "认证失败，请重新登录".to_string(),
            LmsError::InvalidSession { .. } => "会话已失效，请重新登录".to_string(),
            LmsError::TokenExpired => "登录已过期，请重新登录".to_string(),
            LmsError::TokenMalformed { .. } | LmsError::TokenInvalidSignature => {
                "无效的访问令牌".to_string()
            }
            LmsError::TokenRotationMismatch => "刷新令牌已失效，请重新登录".to_string(),
            LmsError::InsufficientPermissions { .. } => "没有权限执行此操作".to_string(),
            LmsError::SelfActionForbidden { message } => message.clone(),
            LmsError::Validation { field, message } => format!("{}: {}", field, message),
            LmsError::SystemRoleProtected { .. } => "系统角色不可修改".to_string(),
            LmsError::NotFound { .. } => "请求的资源不存在".to_string(),
            LmsError::Conflict { .. } => "资源已存在或状态冲突".to_string(),
            LmsError::PermissionLookupFailed { .. } | LmsError::Database { .. } => {
                "服务暂时不可用，请稍后重试".to_string()
            }
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                user_id: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.metadata.user_id = Some(user_id.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &LmsError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, LmsError>;

// === 转换实现 ===

impl From<serde_json::Error> for LmsError {
    fn from(err: serde_json::Error) -> Self {
        LmsError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for LmsError {
    fn from(err: uuid::Error) -> Self {
        LmsError::Validation {
            field: "id".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for LmsError {
    fn from(err: anyhow::Error) -> Self {
        LmsError::Internal {
            message: err.to_string(),
            details: None,
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for LmsError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if matches!(self.severity(), ErrorSeverity::High | ErrorSeverity::Critical) {
            let metadata = ErrorMetadataBuilder::new("http").build(&self);
            self.log(&metadata);
        }

        let body = serde_json::json!({
            "error": self.code(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}
