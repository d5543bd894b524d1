//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 消息代理错误 ====================
    #[error("消息代理错误: {0}")]
    Broker(String),

    #[error("消息序列化失败: {0}")]
    Serialization(String),

    // ==================== 业务逻辑错误 ====================
    #[error("非法状态流转: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("任务执行失败: task_id={task_id}, 原因={reason}")]
    TaskExecution { task_id: String, reason: String },

    #[error("投递失败: 渠道={channel}, 原因={reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("操作频率超限: {operation}")]
    RateLimitExceeded { operation: String },

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
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::TaskExecution { .. } => "TASK_EXECUTION_ERROR",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 基础设施层的瞬时故障可重试；业务逻辑错误（验证失败、非法流转等）
    /// 重试不会改变结果，直接向上传播。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Broker(_))
    }
}

impl From<lapin::Error> for NotifyError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = NotifyError::NotFound {
            entity: "Task".to_string(),
            id: "t-001".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = NotifyError::RateLimitExceeded {
            operation: "email.send".to_string(),
        };
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_is_retryable() {
        let broker_err = NotifyError::Broker("连接断开".to_string());
        assert!(broker_err.is_retryable());

        let db_err = NotifyError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let validation = NotifyError::Validation("邮箱格式无效".to_string());
        assert!(!validation.is_retryable());

        let rate_limited = NotifyError::RateLimitExceeded {
            operation: "sms.send".to_string(),
        };
        assert!(!rate_limited.is_retryable());
    }

    #[test]
    fn test_transition_error_display() {
        let err = NotifyError::InvalidTransition {
            entity: "Task".to_string(),
            from: "COMPLETED".to_string(),
            to: "PENDING".to_string(),
        };
        assert_eq!(err.to_string(), "非法状态流转: Task COMPLETED -> PENDING");
    }
}
