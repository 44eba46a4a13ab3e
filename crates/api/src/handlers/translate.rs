use axum::{extract::State, Json};
use subtitle_domain::{JobResultsView, SubmitRequest};

use crate::{error::ApiResult, owner::Owner, response::ApiResponse, routes::AppState};

/// 在本进程内完成翻译并返回终态结果
pub async fn translate_direct(
    State(state): State<AppState>,
    owner: Owner,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<ApiResponse<JobResultsView>> {
    let job = state.translator.translate(&owner.0, request).await?;
    let view = state.distributor.aggregator().job_results(&job.session_id).await?;
    let message = format!("已完成 {}/{} 行", view.completed_lines, view.total_lines);
    Ok(ApiResponse::success_with_message(view, message))
}
