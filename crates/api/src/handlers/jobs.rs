//! 任务提交、查询与取消

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use subtitle_domain::{
    CancelOutcome, Job, JobResultsView, JobStatusView, SubmitRequest, SubmitSummary,
};
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    owner::Owner,
    response::ApiResponse,
    routes::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAllSummary {
    pub cancelled: u32,
}

/// 读取任务并校验归属
pub(crate) async fn owned_job(state: &AppState, session_id: &str, owner: &Owner) -> ApiResult<Job> {
    let job = state
        .jobs
        .get(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("任务 {session_id} 不存在")))?;
    if job.owner_id != owner.0 {
        return Err(ApiError::Forbidden(format!("无权访问任务 {session_id}")));
    }
    Ok(job)
}

pub async fn submit_job(
    State(state): State<AppState>,
    owner: Owner,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, ApiResponse<SubmitSummary>)> {
    info!("用户 {} 提交任务 {}（{} 行）", owner.0, request.session_id, request.lines.len());
    let summary = state.distributor.submit(&owner.0, request).await?;
    let message = summary.message.clone();
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::success_with_message(summary, message),
    ))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<String>,
) -> ApiResult<ApiResponse<JobStatusView>> {
    owned_job(&state, &session_id, &owner).await?;
    let view = state.distributor.aggregator().job_status(&session_id).await?;
    Ok(ApiResponse::success(view))
}

pub async fn get_job_results(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<String>,
) -> ApiResult<ApiResponse<JobResultsView>> {
    owned_job(&state, &session_id, &owner).await?;
    let view = state.distributor.aggregator().job_results(&session_id).await?;
    Ok(ApiResponse::success(view))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<String>,
) -> ApiResult<ApiResponse<CancelOutcome>> {
    let outcome = state.distributor.registry().cancel(&session_id, &owner.0).await?;
    match outcome.code {
        None => {
            let message = outcome.message.clone();
            Ok(ApiResponse::success_with_message(outcome, message))
        }
        Some(code) => Err(ApiError::CancelRejected(code, outcome.message)),
    }
}

pub async fn cancel_all_jobs(
    State(state): State<AppState>,
    owner: Owner,
) -> ApiResult<ApiResponse<CancelAllSummary>> {
    let cancelled = state.distributor.registry().cancel_all(&owner.0).await?;
    Ok(ApiResponse::success_with_message(
        CancelAllSummary { cancelled },
        format!("已取消 {cancelled} 个任务"),
    ))
}
