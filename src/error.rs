//! Ember IM 错误类型定义

use thiserror::Error;

use crate::codes::StatusCode;

/// 网关核心错误类型
#[derive(Debug, Error)]
pub enum EmberError {
    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// 会话冲突（同用户同设备类型已在线）
    #[error("Session conflict: user {user_id} device {device_type} already online")]
    SessionConflict { user_id: i64, device_type: String },

    /// 无效的参数
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 业务规则错误（由业务处理器抛出，携带明确状态码）
    #[error("Business error {code}: {message}")]
    Business { code: i32, message: String },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 网关核心结果类型
pub type Result<T> = std::result::Result<T, EmberError>;

impl EmberError {
    /// 映射为应答通知中的应用层状态码
    pub fn status_code(&self) -> i32 {
        match self {
            EmberError::AuthFailed(_) => StatusCode::Unauthorized.as_i32(),
            EmberError::SessionConflict { .. } => StatusCode::Conflict.as_i32(),
            EmberError::InvalidParameter(_) => StatusCode::InvalidParameter.as_i32(),
            EmberError::Business { code, .. } => *code,
            EmberError::Configuration(_) => StatusCode::ServerError.as_i32(),
            EmberError::Internal(_) => StatusCode::ServerError.as_i32(),
            EmberError::Other(_) => StatusCode::ServerError.as_i32(),
        }
    }

    /// 便捷构造：业务错误
    pub fn business(code: StatusCode, message: impl Into<String>) -> Self {
        EmberError::Business {
            code: code.as_i32(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            EmberError::AuthFailed("bad token".into()).status_code(),
            StatusCode::Unauthorized.as_i32()
        );
        assert_eq!(
            EmberError::Internal("boom".into()).status_code(),
            StatusCode::ServerError.as_i32()
        );
        assert_eq!(
            EmberError::business(StatusCode::InvalidParameter, "missing field").status_code(),
            StatusCode::InvalidParameter.as_i32()
        );
    }
}
