use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtitle_core::DispatchError;
use subtitle_domain::CancelCode;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("分发错误: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("缺少用户标识")]
    MissingOwner,

    #[error("权限不足: {0}")]
    Forbidden(String),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("取消被拒绝: {1}")]
    CancelRejected(CancelCode, String),

    #[error("指标未启用")]
    MetricsDisabled,
}

struct ErrorBody {
    status: StatusCode,
    code: &'static str,
    message: String,
    suggestions: Vec<String>,
}

impl ErrorBody {
    fn new(status: StatusCode, code: &'static str, message: String, suggestions: &[&str]) -> Self {
        Self {
            status,
            code,
            message,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ApiError {
    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Dispatch(err) => dispatch_body(err),
            ApiError::MissingOwner => ErrorBody::new(
                StatusCode::UNAUTHORIZED,
                "MISSING_OWNER",
                self.to_string(),
                &["请在请求头中添加 x-user-id"],
            ),
            ApiError::Forbidden(msg) => ErrorBody::new(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                msg.clone(),
                &["只能操作自己提交的任务"],
            ),
            ApiError::NotFound(msg) => ErrorBody::new(
                StatusCode::NOT_FOUND,
                "JOB_NOT_FOUND",
                msg.clone(),
                &["请检查会话ID是否正确"],
            ),
            ApiError::CancelRejected(code, msg) => cancel_body(*code, msg.clone()),
            ApiError::MetricsDisabled => ErrorBody::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "METRICS_DISABLED",
                self.to_string(),
                &["在配置中设置 observability.metrics_enabled = true"],
            ),
        }
    }
}

/// 取消失败的原因各自使用独立的错误码
fn cancel_body(code: CancelCode, message: String) -> ErrorBody {
    match code {
        CancelCode::NotFound => ErrorBody::new(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            message,
            &["请检查会话ID是否正确"],
        ),
        CancelCode::Forbidden => ErrorBody::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            message,
            &["只能取消自己提交的任务"],
        ),
        CancelCode::AlreadyCompleted => ErrorBody::new(
            StatusCode::CONFLICT,
            code.as_str(),
            message,
            &["任务已完成，可以直接获取结果"],
        ),
        CancelCode::AlreadyFailed => ErrorBody::new(
            StatusCode::CONFLICT,
            code.as_str(),
            message,
            &["任务已失败或已被取消，无需重复操作"],
        ),
    }
}

fn dispatch_body(err: &DispatchError) -> ErrorBody {
    let message = err.to_string();
    match err {
        DispatchError::InvalidInput(_) => ErrorBody::new(
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            message,
            &["请检查会话ID和字幕行是否有效"],
        ),
        DispatchError::DuplicateSession { .. } => ErrorBody::new(
            StatusCode::CONFLICT,
            "DUPLICATE_SESSION",
            message,
            &["每个任务需要使用唯一的会话ID"],
        ),
        DispatchError::ResourceExhausted(_) => ErrorBody::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "NO_CAPACITY",
            message,
            &["当前没有可用的Worker或API密钥，请稍后重试"],
        ),
        DispatchError::InsufficientQuota { .. } => ErrorBody::new(
            StatusCode::TOO_MANY_REQUESTS,
            "INSUFFICIENT_QUOTA",
            message,
            &["今日配额已用完，请明天再试"],
        ),
        DispatchError::JobNotFound { .. } => ErrorBody::new(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            message,
            &["请检查会话ID是否正确"],
        ),
        DispatchError::TaskNotFound { .. } => ErrorBody::new(
            StatusCode::NOT_FOUND,
            "TASK_NOT_FOUND",
            message,
            &["回调的批次不存在，可能任务已被清理"],
        ),
        DispatchError::ResourceNotFound { .. } => ErrorBody::new(
            StatusCode::NOT_FOUND,
            "RESOURCE_NOT_FOUND",
            message,
            &[],
        ),
        DispatchError::InvalidCallbackKey(_) | DispatchError::UnknownStatus(_) => ErrorBody::new(
            StatusCode::BAD_REQUEST,
            "INVALID_CALLBACK",
            message,
            &["会话键格式应为 {sessionId}_batch{N}", "状态只能是 completed、failed 或 processing"],
        ),
        DispatchError::TransportFailure(_)
        | DispatchError::UpstreamFailure { .. }
        | DispatchError::Timeout(_) => ErrorBody::new(
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_ERROR",
            message,
            &["上游服务暂时不可用，请稍后重试"],
        ),
        _ => ErrorBody::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "系统内部错误".to_string(),
            &["系统遇到内部错误，请稍后重试", "查看 GET /health 检查系统状态"],
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        if body.status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        }

        let json = Json(json!({
            "success": false,
            "error": {
                "code": body.code,
                "message": body.message,
                "status": body.status.as_u16(),
                "suggestions": body.suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (body.status, json).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_status_codes() {
        let cases = [
            (DispatchError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (DispatchError::ResourceExhausted("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                DispatchError::InsufficientQuota { requested: 5, remaining: 0 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                DispatchError::JobNotFound { session_id: "s".into() },
                StatusCode::NOT_FOUND,
            ),
            (DispatchError::UnknownStatus("done".into()), StatusCode::BAD_REQUEST),
            (DispatchError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_cancel_rejections_use_distinct_codes() {
        let cases = [
            (CancelCode::NotFound, StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
            (CancelCode::Forbidden, StatusCode::FORBIDDEN, "FORBIDDEN"),
            (CancelCode::AlreadyCompleted, StatusCode::CONFLICT, "ALREADY_COMPLETED"),
            (CancelCode::AlreadyFailed, StatusCode::CONFLICT, "ALREADY_FAILED"),
        ];
        for (code, status, expected) in cases {
            let body = ApiError::CancelRejected(code, "x".into()).body();
            assert_eq!(body.status, status);
            assert_eq!(body.code, expected);
        }
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let body = ApiError::from(DispatchError::Internal("lock poisoned".into())).body();
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert!(!body.message.contains("lock poisoned"));
    }
}
