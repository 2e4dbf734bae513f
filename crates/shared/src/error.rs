//! 统一错误处理模块
//!
//! 定义接入链路中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum FleetError {
    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    // ==================== AMQP 错误 ====================
    #[error("AMQP 错误: {0}")]
    Amqp(String),

    #[error("AMQP 连接失败: {0}")]
    AmqpConnection(String),

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Amqp(_) => "AMQP_ERROR",
            Self::AmqpConnection(_) => "AMQP_CONNECTION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施层的瞬时故障才值得重试，数据本身的问题重试多少次都不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Amqp(_) | Self::AmqpConnection(_)
        )
    }
}

impl From<lapin::Error> for FleetError {
    fn from(err: lapin::Error) -> Self {
        Self::Amqp(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = FleetError::InvalidArgument {
            field: "srid".to_string(),
            message: "必须为正数".to_string(),
        };
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        assert_eq!(err.to_string(), "无效的参数: srid - 必须为正数");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = FleetError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let amqp_err = FleetError::Amqp("channel closed".to_string());
        assert!(amqp_err.is_retryable());

        let validation = FleetError::Validation("缺少 device_id".to_string());
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_serialization_error_not_retryable() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = FleetError::from(err);
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
        assert!(!err.is_retryable());
    }
}
