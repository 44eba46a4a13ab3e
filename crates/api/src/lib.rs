//! 字幕分发服务的HTTP接口
//!
//! - `POST /api/subtitle/jobs` 提交任务（用户来自 `x-user-id` 请求头）
//! - `GET /api/subtitle/jobs/{sessionId}/status` 任务进度
//! - `GET /api/subtitle/jobs/{sessionId}/results` 任务结果，处理中返回已完成部分
//! - `POST /api/subtitle/jobs/{sessionId}/cancel` / `POST /api/subtitle/jobs/cancel-all` 取消
//! - `POST /api/subtitle/callback` Worker批次回调
//! - `POST /api/subtitle/translate` 单进程翻译
//! - `GET /api/subtitle/resources/...` 密钥冷却与名额状态
//! - `GET /health`、`GET /metrics`

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod owner;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

pub use error::{ApiError, ApiResult};
pub use owner::Owner;
pub use response::ApiResponse;
pub use routes::{create_routes, AppState};

pub fn create_app(state: AppState, cors_enabled: bool) -> Router {
    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(middleware::trace_layer())
            .layer(axum::middleware::from_fn(middleware::request_logging)),
    );
    if cors_enabled {
        router.layer(middleware::cors_layer())
    } else {
        router
    }
}
