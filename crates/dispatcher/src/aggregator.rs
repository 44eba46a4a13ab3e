//! 批次结果汇总
//!
//! 批次进入终态后重新计算任务进度；分发阶段结束且所有批次都结束时任务进入终态，
//! 结果按批次起始位置合并，并且只由完成终态转换的那一次调用负责退款和通知。

use std::collections::BTreeMap;
use std::sync::Arc;

use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{
    parse_composite_key, ApiKey, ApiKeyUsage, CallbackPayload, CallbackStatus, ClientNotification,
    Job, JobNotifier, JobRepository, JobResultsView, JobStatus, JobStatusView, PooledResource,
    ServerTask, TaskRepository, TaskStatus, TranslatedLine,
};
use subtitle_infrastructure::DispatchMetrics;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationRegistry;
use crate::cooldown::CooldownManager;
use crate::refund::RefundBook;
use crate::resource_pool::ResourcePool;

pub struct ResultAggregator {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    key_pool: Arc<ResourcePool<ApiKey>>,
    key_cooldown: Arc<CooldownManager<ApiKey>>,
    refunds: Arc<RefundBook>,
    registry: Arc<CancellationRegistry>,
    notifier: Option<Arc<dyn JobNotifier>>,
    metrics: DispatchMetrics,
}

impl ResultAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        key_pool: Arc<ResourcePool<ApiKey>>,
        key_cooldown: Arc<CooldownManager<ApiKey>>,
        refunds: Arc<RefundBook>,
        registry: Arc<CancellationRegistry>,
        notifier: Option<Arc<dyn JobNotifier>>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            key_pool,
            key_cooldown,
            refunds,
            registry,
            notifier,
            metrics: DispatchMetrics::new(),
        }
    }

    /// 应用Worker回调（同步响应体也走这里）
    ///
    /// 复合键或状态无法解析时直接返回错误，不产生任何副作用。
    pub async fn apply_callback(&self, payload: &CallbackPayload) -> DispatchResult<ServerTask> {
        let (session_id, batch_index) = parse_composite_key(&payload.session_id)?;
        let status = payload.parsed_status()?;

        let task = self
            .tasks
            .get(&session_id, batch_index)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound {
                session_id: session_id.clone(),
                batch_index,
            })?;
        if task.status.is_terminal() {
            debug!("批次 {} 已处于终态 {}，忽略重复回调", task.composite_key(), task.status.as_str());
            return Ok(task);
        }

        self.account_key_usage(&payload.api_key_usage).await;

        let results = payload.results.clone().unwrap_or_default();
        let error = payload
            .error
            .clone()
            .unwrap_or_else(|| "Worker报告批次失败".to_string());
        let (task, changed) = self
            .tasks
            .modify(
                &session_id,
                batch_index,
                Box::new(move |task| match status {
                    CallbackStatus::Processing => task.update_status(TaskStatus::Processing),
                    CallbackStatus::Completed => task.complete(results),
                    CallbackStatus::Failed => {
                        if !task.fail(error) {
                            return false;
                        }
                        // 失败批次可能带有部分结果
                        task.results = results;
                        true
                    }
                }),
            )
            .await?;

        if changed && task.status.is_terminal() {
            info!(
                "批次 {} 回调: {}（{} 行）",
                task.composite_key(),
                task.status.as_str(),
                task.line_count
            );
            self.on_task_terminal(&task).await?;
        }
        Ok(task)
    }

    /// 统计Worker上报的密钥使用情况
    ///
    /// 失败的密钥进入递增冷却；请求数计入每日用量；成功数只累加总成功次数，
    /// 不会清零连续失败计数。
    pub async fn account_key_usage(&self, usages: &[ApiKeyUsage]) {
        if usages.is_empty() {
            return;
        }
        let keys = match self.key_pool.store().list().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("读取API密钥失败，跳过用量统计: {}", e);
                return;
            }
        };

        for usage in usages {
            let Some(key) = keys.iter().find(|k| k.key == usage.api_key) else {
                warn!("回调中包含未知密钥 {}，跳过", usage.masked_key);
                continue;
            };
            let id = key.resource_id();

            if usage.request_count > 0 {
                if let Err(e) = self.key_pool.record_usage(id, usage.request_count).await {
                    warn!("记录密钥 {} 用量失败: {}", key.masked_key(), e);
                }
            }
            if usage.success_count > 0 {
                let successes = usage.success_count as u64;
                if let Err(e) = self
                    .key_pool
                    .store()
                    .update_state(id, Box::new(move |s| s.total_success += successes))
                    .await
                {
                    warn!("记录密钥 {} 成功次数失败: {}", key.masked_key(), e);
                }
            }
            if usage.failure_count > 0 {
                let detail = format!("Worker报告失败 {} 次", usage.failure_count);
                if let Err(e) = self.key_cooldown.set_cooldown(id, &detail).await {
                    warn!("设置密钥 {} 冷却失败: {}", key.masked_key(), e);
                }
            }
        }
    }

    pub async fn on_task_terminal(&self, task: &ServerTask) -> DispatchResult<Job> {
        self.recompute(&task.session_id).await
    }

    /// 重新计算任务状态，可重复调用；任务已是终态时不产生任何副作用
    pub async fn recompute(&self, session_id: &str) -> DispatchResult<Job> {
        let job = self.require_job(session_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }

        let tasks = self.tasks.list_for_job(session_id).await?;
        let completed: u32 = tasks
            .iter()
            .filter(|t| t.status.is_success())
            .map(|t| t.line_count)
            .sum();
        let all_terminal = !tasks.is_empty()
            && tasks.len() as u32 >= job.batch_count
            && tasks.iter().all(|t| t.status.is_terminal());
        // 分发阶段失败的批次还会被重发
        let settled = all_terminal && job.status != JobStatus::Distributing;

        if !settled {
            let (job, _) = self
                .jobs
                .modify(
                    session_id,
                    Box::new(move |job| {
                        if job.is_terminal() {
                            return false;
                        }
                        job.update_progress(completed);
                        true
                    }),
                )
                .await?;
            debug!("任务 {} 进度 {:.2}%", session_id, job.rounded_progress());
            return Ok(job);
        }

        let successes = tasks.iter().filter(|t| t.status.is_success()).count();
        let status = if successes == tasks.len() {
            JobStatus::Completed
        } else if successes > 0 {
            JobStatus::PartialCompleted
        } else {
            JobStatus::Failed
        };
        let error = error_summary(&tasks);
        let merged = merge_results(&tasks);

        let (job, changed) = self
            .jobs
            .modify(
                session_id,
                Box::new(move |job| {
                    if job.is_terminal() {
                        return false;
                    }
                    job.update_progress(completed);
                    job.results = merged;
                    job.finish(status, error)
                }),
            )
            .await?;

        if !changed {
            return Ok(job);
        }

        info!(
            "任务 {} 已结束: {}（{}/{} 行）",
            session_id, job.status, job.completed_lines, job.total_lines
        );
        self.metrics.job_finalized(job.status.as_lowercase());
        self.registry.unregister(session_id, &job.owner_id).await;
        self.refunds.refund_unfinished(session_id).await?;
        self.notify(&job).await;
        Ok(job)
    }

    async fn notify(&self, job: &Job) {
        let (Some(notifier), Some(url)) = (&self.notifier, &job.callback_url) else {
            return;
        };
        let notification = ClientNotification {
            session_id: job.session_id.clone(),
            status: job.status.as_lowercase().to_string(),
            total_lines: job.total_lines,
            completed_lines: job.completed_lines,
            progress: job.rounded_progress(),
            error: job.error_message.clone(),
        };
        match notifier.notify(url, &notification).await {
            Ok(()) => debug!("已通知任务 {} 的回调地址", job.session_id),
            Err(e) => warn!("通知任务 {} 的回调地址失败: {}", job.session_id, e),
        }
    }

    async fn require_job(&self, session_id: &str) -> DispatchResult<Job> {
        self.jobs
            .get(session_id)
            .await?
            .ok_or_else(|| DispatchError::JobNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn job_status(&self, session_id: &str) -> DispatchResult<JobStatusView> {
        let job = self.require_job(session_id).await?;
        let tasks = self.tasks.list_for_job(session_id).await?;
        let mut task_stats = BTreeMap::new();
        for task in &tasks {
            *task_stats.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(JobStatusView {
            session_id: job.session_id.clone(),
            status: job.status.to_string(),
            progress: job.rounded_progress(),
            total_lines: job.total_lines,
            completed_lines: job.completed_lines,
            error: job.error_message,
            task_stats,
        })
    }

    /// 任务未结束时返回已完成批次的部分结果
    pub async fn job_results(&self, session_id: &str) -> DispatchResult<JobResultsView> {
        let job = self.require_job(session_id).await?;
        let results = if job.is_terminal() {
            job.results.clone()
        } else {
            let tasks: Vec<ServerTask> = self
                .tasks
                .list_for_job(session_id)
                .await?
                .into_iter()
                .filter(|t| t.status.is_success())
                .collect();
            merge_results(&tasks)
        };
        Ok(JobResultsView {
            session_id: job.session_id.clone(),
            status: job.status.to_string(),
            total_lines: job.total_lines,
            completed_lines: job.completed_lines,
            results,
            error: job.error_message,
            created_at: job.created_at,
            completed_at: job.completed_at,
        })
    }
}

/// 按批次起始位置、再按行号合并结果，与完成顺序无关
pub fn merge_results(tasks: &[ServerTask]) -> Vec<TranslatedLine> {
    let mut ordered: Vec<&ServerTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.start_index);

    let mut merged = Vec::new();
    for task in ordered {
        let mut lines = task.results.clone();
        lines.sort_by_key(|l| l.index);
        merged.extend(lines);
    }
    merged
}

/// 失败批次的错误汇总：`Batch {i}: {err}`，以 `; ` 连接
pub fn error_summary(tasks: &[ServerTask]) -> Option<String> {
    let mut failed: Vec<&ServerTask> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    if failed.is_empty() {
        return None;
    }
    failed.sort_by_key(|t| t.batch_index);
    Some(
        failed
            .iter()
            .map(|t| {
                format!(
                    "Batch {}: {}",
                    t.batch_index,
                    t.error_message.as_deref().unwrap_or("未知错误")
                )
            })
            .collect::<Vec<_>>()
            .join("; "),
    )
}
