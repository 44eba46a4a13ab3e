use axum::{extract::State, Json};
use serde::Serialize;
use subtitle_domain::CallbackPayload;
use tracing::debug;

use crate::{error::ApiResult, response::ApiResponse, routes::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub session_id: String,
    pub batch_index: u32,
    pub task_status: String,
}

/// Worker批次回调，会话键格式为 `{sessionId}_batch{N}`
pub async fn worker_callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> ApiResult<ApiResponse<CallbackAck>> {
    debug!("收到回调 {}（{}）", payload.session_id, payload.status);
    let task = state.distributor.handle_callback(payload).await?;
    Ok(ApiResponse::success(CallbackAck {
        session_id: task.session_id,
        batch_index: task.batch_index,
        task_status: task.status.as_str().to_string(),
    }))
}
