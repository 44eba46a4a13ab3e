use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// 分发引擎指标
///
/// 未安装记录器时所有调用都是空操作，测试中无需额外准备。
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn job_submitted(&self, lines: u32, batches: u32) {
        counter!("subtitle_jobs_submitted_total").increment(1);
        histogram!("subtitle_job_lines").record(lines as f64);
        histogram!("subtitle_job_batches").record(batches as f64);
    }

    pub fn job_finalized(&self, status: &str) {
        counter!("subtitle_jobs_finalized_total", "status" => status.to_string()).increment(1);
    }

    pub fn batch_sent(&self, server_id: &str, success: bool, duration_ms: u64) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "subtitle_batches_sent_total",
            "server" => server_id.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("subtitle_batch_send_duration_ms").record(duration_ms as f64);
    }

    pub fn batch_retried(&self) {
        counter!("subtitle_batch_retries_total").increment(1);
    }

    pub fn slot_acquired(&self, pool: &str) {
        counter!("subtitle_slots_acquired_total", "pool" => pool.to_string()).increment(1);
    }

    pub fn slot_released(&self, pool: &str, early: bool) {
        let kind = if early { "early" } else { "window" };
        counter!(
            "subtitle_slots_released_total",
            "pool" => pool.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn resource_disabled(&self, pool: &str, reason: &str) {
        counter!(
            "subtitle_resources_disabled_total",
            "pool" => pool.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn cooldown_applied(&self, failures: u32) {
        counter!("subtitle_cooldowns_total").increment(1);
        gauge!("subtitle_last_cooldown_failures").set(failures as f64);
    }

    pub fn lines_refunded(&self, lines: u32) {
        counter!("subtitle_lines_refunded_total").increment(lines as u64);
    }
}

/// 安装全局Prometheus记录器，返回用于渲染 `/metrics` 的句柄
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("安装Prometheus指标记录器失败")
}
