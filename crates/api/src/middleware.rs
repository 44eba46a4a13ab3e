use axum::{
    extract::Request,
    http::{header, HeaderName, Method},
    middleware::Next,
    response::Response,
};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::owner::OWNER_HEADER;

const CALLBACK_PATH: &str = "/api/subtitle/callback";

/// 记录请求方与处理结果
///
/// Worker回调频率高，成功时只记 debug；其余请求带上 `x-user-id` 记 info，失败记 warn。
pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let owner = request
        .headers()
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "-".to_string());
    let start = std::time::Instant::now();

    debug!("开始处理请求: {} {} 用户: {}", method, path, owner);

    let response = next.run(request).await;
    let duration = start.elapsed();
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        warn!(
            "请求处理失败: {} {} 用户: {} - 状态: {} - 耗时: {:?}",
            method, path, owner, status, duration
        );
    } else if path == CALLBACK_PATH {
        debug!("收到Worker回调: 状态: {} - 耗时: {:?}", status, duration);
    } else {
        info!(
            "完成请求处理: {} {} 用户: {} - 状态: {} - 耗时: {:?}",
            method, path, owner, status, duration
        );
    }

    response
}

/// 浏览器客户端需要携带 `x-user-id` 提交和查询任务
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(OWNER_HEADER)])
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
