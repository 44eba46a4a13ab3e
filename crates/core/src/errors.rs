use thiserror::Error;

/// 分发引擎错误类型定义
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("会话ID已存在: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("资源不足: {0}")]
    ResourceExhausted(String),

    #[error("配额不足: 请求 {requested} 行, 剩余 {remaining} 行")]
    InsufficientQuota { requested: u32, remaining: u32 },

    #[error("任务未找到: {session_id}")]
    JobNotFound { session_id: String },

    #[error("批次任务未找到: {session_id} 批次 {batch_index}")]
    TaskNotFound { session_id: String, batch_index: u32 },

    #[error("资源未找到: {id}")]
    ResourceNotFound { id: String },

    #[error("传输失败: {0}")]
    TransportFailure(String),

    #[error("上游错误 HTTP {status}: {message}")]
    UpstreamFailure { status: u16, message: String },

    #[error("无效的回调会话键: {0}")]
    InvalidCallbackKey(String),

    #[error("未知的回调状态: {0}")]
    UnknownStatus(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("超时: {0}")]
    Timeout(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DispatchError {
    /// 请求在到达上游之前失败（代理不可达、连接被拒绝等）
    pub fn is_transport(&self) -> bool {
        matches!(self, DispatchError::TransportFailure(_) | DispatchError::Timeout(_))
    }

    /// 上游返回限流响应
    pub fn is_rate_limited(&self) -> bool {
        match self {
            DispatchError::UpstreamFailure { status, message } => {
                *status == 429 || message.contains("RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }

    /// 上游拒绝凭据本身（无效或被封禁的API密钥）
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DispatchError::UpstreamFailure { status, message } => {
                *status == 401
                    || *status == 403
                    || message.contains("INVALID_ARGUMENT")
                    || message.contains("API key")
            }
            _ => false,
        }
    }

    /// 调用方输入导致的错误，而非系统容量问题
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidInput(_)
                | DispatchError::DuplicateSession { .. }
                | DispatchError::InsufficientQuota { .. }
                | DispatchError::InvalidCallbackKey(_)
                | DispatchError::UnknownStatus(_)
        )
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_classification() {
        let limited = DispatchError::UpstreamFailure {
            status: 429,
            message: "quota".to_string(),
        };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_auth_failure());
        assert!(!limited.is_transport());

        let exhausted = DispatchError::UpstreamFailure {
            status: 500,
            message: "RESOURCE_EXHAUSTED: try later".to_string(),
        };
        assert!(exhausted.is_rate_limited());

        let invalid = DispatchError::UpstreamFailure {
            status: 400,
            message: "API key not valid. Please pass a valid API key.".to_string(),
        };
        assert!(invalid.is_auth_failure());

        let forbidden = DispatchError::UpstreamFailure {
            status: 403,
            message: String::new(),
        };
        assert!(forbidden.is_auth_failure());
    }

    #[test]
    fn test_transport_and_user_errors() {
        assert!(DispatchError::TransportFailure("connection refused".to_string()).is_transport());
        assert!(DispatchError::InvalidInput("empty".to_string()).is_user_error());
        assert!(!DispatchError::ResourceExhausted("no server".to_string()).is_user_error());
    }
}
