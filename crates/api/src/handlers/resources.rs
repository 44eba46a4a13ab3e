use axum::extract::{Path, State};
use serde::Serialize;
use subtitle_core::DispatchError;
use subtitle_dispatcher::{CooldownEntry, PoolStatus};

use crate::{error::ApiResult, response::ApiResponse, routes::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatusView {
    pub id: String,
    pub masked_key: String,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub requests_today: u32,
    pub daily_limit: Option<u32>,
    pub total_success: u64,
    pub consecutive_failures: u32,
    pub slots: PoolStatus,
}

pub async fn list_cooldowns(
    State(state): State<AppState>,
) -> ApiResult<ApiResponse<Vec<CooldownEntry>>> {
    let entries = state.key_cooldown.keys_in_cooldown().await?;
    Ok(ApiResponse::success(entries))
}

pub async fn get_key_status(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
) -> ApiResult<ApiResponse<KeyStatusView>> {
    let key = state
        .key_pool
        .store()
        .get(&key_id)
        .await?
        .ok_or_else(|| DispatchError::ResourceNotFound { id: key_id.clone() })?;
    let slots = state.key_pool.status(&key_id).await?;
    Ok(ApiResponse::success(KeyStatusView {
        masked_key: key.masked_key(),
        enabled: key.state.enabled,
        disabled_reason: key.state.disabled_reason,
        requests_today: key.state.requests_today,
        daily_limit: key.daily_limit,
        total_success: key.state.total_success,
        consecutive_failures: key.state.consecutive_failures,
        id: key.id,
        slots,
    }))
}
