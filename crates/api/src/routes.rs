use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use subtitle_dispatcher::{CooldownManager, DirectTranslator, JobDistributor, ResourcePool};
use subtitle_domain::{ApiKey, JobRepository};

use crate::handlers::{
    callback::worker_callback,
    health::health_check,
    jobs::{cancel_all_jobs, cancel_job, get_job_results, get_job_status, submit_job},
    metrics::render_metrics,
    resources::{get_key_status, list_cooldowns},
    translate::translate_direct,
};

#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<JobDistributor>,
    pub translator: Arc<DirectTranslator>,
    pub jobs: Arc<dyn JobRepository>,
    pub key_pool: Arc<ResourcePool<ApiKey>>,
    pub key_cooldown: Arc<CooldownManager<ApiKey>>,
    /// 未启用指标时为None
    pub metrics_handle: Option<PrometheusHandle>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        // 任务
        .route("/api/subtitle/jobs", post(submit_job))
        .route("/api/subtitle/jobs/cancel-all", post(cancel_all_jobs))
        .route("/api/subtitle/jobs/{session_id}/status", get(get_job_status))
        .route("/api/subtitle/jobs/{session_id}/results", get(get_job_results))
        .route("/api/subtitle/jobs/{session_id}/cancel", post(cancel_job))
        // Worker回调
        .route("/api/subtitle/callback", post(worker_callback))
        .route("/api/subtitle/translate", post(translate_direct))
        // 资源
        .route("/api/subtitle/resources/cooldowns", get(list_cooldowns))
        .route("/api/subtitle/resources/keys/{key_id}", get(get_key_status))
        .with_state(state)
}
