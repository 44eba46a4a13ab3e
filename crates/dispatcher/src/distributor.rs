//! 任务分发
//!
//! 提交时校验输入、扣除配额并切分批次，批次记录在发送之前全部落库，
//! 之后按轮询把批次分配给Worker服务器。每台服务器按顺序处理自己的队列，
//! 不同服务器之间并发，因此同一任务不会向同一台服务器并发发送。
//!
//! 首轮发送和失败批次的重发完成之前任务保持 `Distributing`，
//! 此时失败的批次仍可能被重发，结果汇总不会让任务进入终态。

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use subtitle_core::{DispatchError, DispatchResult, DistributionConfig};
use subtitle_domain::{
    composite_key, parse_composite_key, ApiKey, BATCH_KEY_DELIMITER, BatchSender, CallbackPayload, CallbackStatus, Job,
    JobRepository, JobStatus, PooledResource, QuotaLedger, ServerTask, SubmitRequest, SubmitSummary,
    TaskRepository, TaskStatus, TranslateRequest, WorkerServer, WorkerServerRepository,
};
use subtitle_infrastructure::DispatchMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::batch_planner::plan;
use crate::cancellation::CancellationRegistry;
use crate::refund::RefundBook;
use crate::resource_pool::ResourcePool;

/// 分发器使用的存储
#[derive(Clone)]
pub struct DispatchStores {
    pub jobs: Arc<dyn JobRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub servers: Arc<dyn WorkerServerRepository>,
    pub quota: Arc<dyn QuotaLedger>,
}

pub struct JobDistributor {
    config: DistributionConfig,
    /// 主服务器回调地址，未启用回调时为None
    callback_url: Option<String>,
    stores: DispatchStores,
    key_pool: Arc<ResourcePool<ApiKey>>,
    refunds: Arc<RefundBook>,
    registry: Arc<CancellationRegistry>,
    aggregator: Arc<ResultAggregator>,
    sender: Arc<dyn BatchSender>,
    server_cursor: AtomicUsize,
    key_cursor: AtomicUsize,
    metrics: DispatchMetrics,
}

impl JobDistributor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DistributionConfig,
        callback_url: Option<String>,
        stores: DispatchStores,
        key_pool: Arc<ResourcePool<ApiKey>>,
        refunds: Arc<RefundBook>,
        registry: Arc<CancellationRegistry>,
        aggregator: Arc<ResultAggregator>,
        sender: Arc<dyn BatchSender>,
    ) -> Self {
        let callback_url = callback_url.filter(|_| config.enable_callback);
        Self {
            config,
            callback_url,
            stores,
            key_pool,
            refunds,
            registry,
            aggregator,
            sender,
            server_cursor: AtomicUsize::new(0),
            key_cursor: AtomicUsize::new(0),
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// 可用服务器：启用，按空闲、优先级（高在前）、失败次数排序
    async fn available_servers(&self) -> DispatchResult<Vec<WorkerServer>> {
        let mut servers: Vec<WorkerServer> = self
            .stores
            .servers
            .list()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        servers.sort_by_key(|s| (s.is_busy, Reverse(s.priority), s.failure_count));
        Ok(servers)
    }

    /// 可用密钥：启用、未冷却、未达每日上限，按累计成功次数从高到低
    async fn available_keys(&self, excluded: &HashSet<String>) -> DispatchResult<Vec<ApiKey>> {
        let now = Utc::now();
        let mut keys: Vec<ApiKey> = self
            .key_pool
            .store()
            .list()
            .await?
            .into_iter()
            .filter(|k| !excluded.contains(&k.id))
            .filter(|k| k.state.is_selectable(now, k.daily_limit))
            .collect();
        keys.sort_by_key(|k| Reverse(k.state.total_success));
        Ok(keys)
    }

    /// 为一个批次轮询选取固定数量的密钥
    async fn select_keys(&self, excluded: &HashSet<String>) -> DispatchResult<Vec<ApiKey>> {
        let mut keys = self.available_keys(excluded).await?;
        if keys.is_empty() && !excluded.is_empty() {
            keys = self.available_keys(&HashSet::new()).await?;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let count = (self.config.api_keys_per_server as usize).min(keys.len());
        let start = self.key_cursor.fetch_add(count, Ordering::Relaxed) % keys.len();
        Ok((0..count).map(|i| keys[(start + i) % keys.len()].clone()).collect())
    }

    fn next_server<'a>(&self, servers: &'a [WorkerServer], avoid: Option<&str>) -> &'a WorkerServer {
        let start = self.server_cursor.fetch_add(1, Ordering::Relaxed);
        let pick = |offset: usize| &servers[(start + offset) % servers.len()];
        (0..servers.len())
            .map(pick)
            .find(|s| Some(s.id.as_str()) != avoid)
            .unwrap_or_else(|| pick(0))
    }

    /// 提交翻译任务
    pub async fn submit(self: &Arc<Self>, owner_id: &str, request: SubmitRequest) -> DispatchResult<SubmitSummary> {
        let session_id = request.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(DispatchError::InvalidInput("会话ID不能为空".to_string()));
        }
        if session_id.contains(BATCH_KEY_DELIMITER) {
            return Err(DispatchError::InvalidInput(format!(
                "会话ID不能包含 {BATCH_KEY_DELIMITER}"
            )));
        }
        if request.lines.is_empty() {
            return Err(DispatchError::InvalidInput("字幕行不能为空".to_string()));
        }
        if self.stores.jobs.get(&session_id).await?.is_some() {
            return Err(DispatchError::DuplicateSession { session_id });
        }

        let requested = request.lines.len() as u32;
        let granted = self.stores.quota.charge(owner_id, requested).await?;
        if granted == 0 {
            return Err(DispatchError::InsufficientQuota {
                requested,
                remaining: 0,
            });
        }

        match self.create_job(owner_id, &session_id, request, granted).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.refunds.refund_charge(owner_id, granted).await?;
                Err(e)
            }
        }
    }

    async fn create_job(
        self: &Arc<Self>,
        owner_id: &str,
        session_id: &str,
        request: SubmitRequest,
        granted: u32,
    ) -> DispatchResult<SubmitSummary> {
        let servers = self.available_servers().await?;
        if servers.is_empty() {
            warn!("没有可用的Worker服务器，拒绝任务 {}", session_id);
            return Err(DispatchError::ResourceExhausted("没有可用的Worker服务器".to_string()));
        }
        if self.available_keys(&HashSet::new()).await?.is_empty() {
            warn!("没有可用的API密钥，拒绝任务 {}", session_id);
            return Err(DispatchError::ResourceExhausted("没有可用的API密钥".to_string()));
        }

        let requested = request.lines.len() as u32;
        let mut lines = request.lines;
        lines.truncate(granted as usize);

        let batches = plan(granted, self.config.lines_per_server, self.config.merge_batch_threshold);
        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let mut job = Job::new(session_id, owner_id, lines, request.prompt, model)
            .with_system_instruction(request.system_instruction)
            .with_callback_url(request.callback_url);
        job.status = JobStatus::Distributing;
        job.batch_count = batches.len() as u32;

        self.stores.jobs.insert(job.clone()).await?;
        // 批次记录在发送之前全部落库，回调到达时记录一定存在
        for span in &batches {
            let task = ServerTask::new(session_id, span.batch_index, span.start, span.len);
            self.stores.tasks.insert(task).await?;
        }

        let timeout = Duration::from_secs(self.config.job_timeout_minutes * 60);
        let token = self.registry.register(session_id, owner_id, timeout).await;
        self.metrics.job_submitted(granted, batches.len() as u32);

        let servers_assigned = servers.len().min(batches.len()) as u32;
        info!(
            "任务 {} 已提交: {} 行，{} 个批次，{} 台服务器",
            session_id,
            granted,
            batches.len(),
            servers_assigned
        );

        let batch_count = batches.len() as u32;
        let distributor = Arc::clone(self);
        let batch_indices: Vec<u32> = batches.iter().map(|b| b.batch_index).collect();
        tokio::spawn(async move {
            distributor.distribute(job, batch_indices, servers, token).await;
        });

        let message = if granted < requested {
            format!("配额不足，仅处理前 {granted} 行（请求 {requested} 行）")
        } else {
            format!("任务已提交，共 {batch_count} 个批次")
        };
        Ok(SubmitSummary {
            session_id: session_id.to_string(),
            status: JobStatus::Distributing.to_string(),
            total_lines: granted,
            batch_count,
            servers_assigned,
            message,
        })
    }

    async fn distribute(
        self: Arc<Self>,
        job: Job,
        batch_indices: Vec<u32>,
        servers: Vec<WorkerServer>,
        token: CancellationToken,
    ) {
        let session_id = job.session_id.clone();

        // 轮询分配，每台服务器一个顺序队列
        let mut queues: Vec<(WorkerServer, Vec<u32>)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for batch_index in batch_indices {
            let server = self.next_server(&servers, None).clone();
            let position = *positions.entry(server.id.clone()).or_insert_with(|| {
                queues.push((server.clone(), Vec::new()));
                queues.len() - 1
            });
            queues[position].1.push(batch_index);
        }

        let job = Arc::new(job);
        join_all(
            queues
                .into_iter()
                .map(|(server, indices)| self.run_queue(&job, server, indices, &token)),
        )
        .await;

        self.retry_failed(&job, &token).await;

        // 分发和重试阶段结束之后，批次全部结束才能让任务进入终态
        if let Err(e) = self
            .stores
            .jobs
            .modify(
                &session_id,
                Box::new(|job| {
                    if job.status != JobStatus::Distributing {
                        return false;
                    }
                    job.status = JobStatus::Processing;
                    true
                }),
            )
            .await
        {
            error!("更新任务 {} 状态失败: {}", session_id, e);
            return;
        }
        if let Err(e) = self.aggregator.recompute(&session_id).await {
            error!("汇总任务 {} 失败: {}", session_id, e);
        }
    }

    async fn run_queue(&self, job: &Job, server: WorkerServer, batch_indices: Vec<u32>, token: &CancellationToken) {
        let delay = Duration::from_millis(self.config.delay_between_server_batches_ms);
        for (position, batch_index) in batch_indices.into_iter().enumerate() {
            if token.is_cancelled() {
                info!("任务 {} 已取消，停止向 {} 发送剩余批次", job.session_id, server.name);
                return;
            }
            if position > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.dispatch_batch(job, &server, batch_index, &HashSet::new()).await {
                error!("分发批次 {} 出错: {}", composite_key(&job.session_id, batch_index), e);
            }
        }
    }

    /// 对失败批次换服务器、换密钥重发，直到达到重试上限或任务被取消
    async fn retry_failed(&self, job: &Job, token: &CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let failed: Vec<ServerTask> = match self.stores.tasks.list_for_job(&job.session_id).await {
                Ok(tasks) => tasks
                    .into_iter()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .filter(|t| t.retry_count < self.config.max_server_retries)
                    .collect(),
                Err(e) => {
                    error!("读取任务 {} 的批次失败: {}", job.session_id, e);
                    return;
                }
            };
            if failed.is_empty() {
                return;
            }
            let servers = match self.available_servers().await {
                Ok(servers) if !servers.is_empty() => servers,
                Ok(_) => {
                    warn!("没有可用服务器，放弃重试任务 {} 的 {} 个批次", job.session_id, failed.len());
                    return;
                }
                Err(e) => {
                    error!("读取服务器列表失败: {}", e);
                    return;
                }
            };

            for task in failed {
                if token.is_cancelled() {
                    return;
                }
                let previous_keys: HashSet<String> = task.api_key_ids.iter().cloned().collect();
                if let Err(e) = self.resend(job, &task, &servers, &previous_keys).await {
                    error!("重发批次 {} 出错: {}", task.composite_key(), e);
                }
            }
        }
    }

    /// 把批次重置为重试状态后发送到另一台服务器
    async fn resend(
        &self,
        job: &Job,
        task: &ServerTask,
        servers: &[WorkerServer],
        excluded_keys: &HashSet<String>,
    ) -> DispatchResult<bool> {
        let (task, changed) = self
            .stores
            .tasks
            .modify(
                &task.session_id,
                task.batch_index,
                Box::new(|task| {
                    if task.status != TaskStatus::Failed && task.status.is_terminal() {
                        return false;
                    }
                    task.reset_for_retry();
                    true
                }),
            )
            .await?;
        if !changed {
            return Ok(false);
        }

        let server = self.next_server(servers, task.server_id.as_deref()).clone();
        info!(
            "重试批次 {}（第 {} 次），改用服务器 {}",
            task.composite_key(),
            task.retry_count,
            server.name
        );
        self.metrics.batch_retried();
        self.dispatch_batch(job, &server, task.batch_index, excluded_keys).await?;
        Ok(true)
    }

    /// 发送单个批次，本次调用内不重试
    async fn dispatch_batch(
        &self,
        job: &Job,
        server: &WorkerServer,
        batch_index: u32,
        excluded_keys: &HashSet<String>,
    ) -> DispatchResult<()> {
        let key = composite_key(&job.session_id, batch_index);
        let task = self
            .stores
            .tasks
            .get(&job.session_id, batch_index)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound {
                session_id: job.session_id.clone(),
                batch_index,
            })?;

        let keys = self.select_keys(excluded_keys).await?;
        if keys.is_empty() {
            warn!("批次 {} 没有可用的API密钥，标记为失败", key);
            self.stores
                .tasks
                .modify(&job.session_id, batch_index, Box::new(|t| t.fail("no available key")))
                .await?;
            return Ok(());
        }

        let lines = job
            .lines
            .get(task.start_index as usize..task.end_index() as usize)
            .ok_or_else(|| DispatchError::Internal(format!("批次 {key} 超出任务行范围")))?
            .to_vec();

        let server_id = server.id.clone();
        let key_ids: Vec<String> = keys.iter().map(|k| k.id.clone()).collect();
        let (task, _) = self
            .stores
            .tasks
            .modify(
                &job.session_id,
                batch_index,
                Box::new(move |t| {
                    t.server_id = Some(server_id);
                    t.api_key_ids = key_ids;
                    t.update_status(TaskStatus::Sent)
                }),
            )
            .await?;

        let batch_size = self.config.batch_size_per_server.max(1);
        let request = TranslateRequest {
            model: job.model.clone(),
            prompt: job.instruction.clone(),
            total_internal_batches: (lines.len() as u32).div_ceil(batch_size),
            lines,
            system_instruction: job.system_instruction.clone(),
            session_id: key.clone(),
            api_keys: keys.iter().map(|k| k.key.clone()).collect(),
            batch_size,
            thinking_budget: self.config.thinking_budget,
            callback_url: self.callback_url.clone(),
            delay_between_batches_ms: self.config.worker_delay_between_batches_ms,
            max_retries: self.config.max_server_retries,
            is_retry: task.retry_count > 0,
            retry_count: task.retry_count,
        };

        let busy_key = key.clone();
        self.stores
            .servers
            .modify(&server.id, Box::new(move |s| s.mark_busy(&busy_key)))
            .await?;

        debug!("发送批次 {} 到 {}（{} 行，{} 个密钥）", key, server.name, task.line_count, keys.len());
        let started = Instant::now();
        let result = self.sender.send_batch(server, &request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let success = result.is_ok();
        let failure_reason = result.as_ref().err().map(|e| e.to_string());
        self.stores
            .servers
            .modify(
                &server.id,
                Box::new(move |s| {
                    s.mark_idle(success);
                    if let Some(reason) = failure_reason {
                        s.record_failure(reason);
                    }
                }),
            )
            .await?;
        self.metrics.batch_sent(&server.id, success, elapsed_ms);

        match result {
            Ok(Some(mut payload)) => {
                if payload.session_id.is_empty() {
                    payload.session_id = key.clone();
                }
                self.mark_processing(job, batch_index, elapsed_ms).await?;
                debug!("批次 {} 同步返回结果", key);
                self.handle_payload(payload).await?;
            }
            Ok(None) => {
                self.mark_processing(job, batch_index, elapsed_ms).await?;
            }
            Err(e) => {
                warn!("批次 {} 发送到 {} 失败: {}", key, server.name, e);
                let error = e.to_string();
                self.stores
                    .tasks
                    .modify(&job.session_id, batch_index, Box::new(move |t| t.fail(error)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn mark_processing(&self, job: &Job, batch_index: u32, elapsed_ms: u64) -> DispatchResult<()> {
        self.stores
            .tasks
            .modify(
                &job.session_id,
                batch_index,
                Box::new(move |t| {
                    t.processing_time_ms = Some(elapsed_ms);
                    t.update_status(TaskStatus::Processing)
                }),
            )
            .await?;
        Ok(())
    }

    /// Worker回调入口
    ///
    /// 报告失败且包含失败密钥的批次在重试次数未用完时换密钥重发，
    /// 其余回调交给结果汇总处理。
    pub async fn handle_callback(self: &Arc<Self>, payload: CallbackPayload) -> DispatchResult<ServerTask> {
        let (session_id, batch_index) = parse_composite_key(&payload.session_id)?;
        let status = payload.parsed_status()?;

        if status == CallbackStatus::Failed && payload.failed_keys().next().is_some() {
            if let Some(task) = self.schedule_resend(&session_id, batch_index, &payload).await? {
                return Ok(task);
            }
        }
        self.aggregator.apply_callback(&payload).await
    }

    /// 同步响应体与回调走同一条路径，但不再触发重发
    async fn handle_payload(&self, payload: CallbackPayload) -> DispatchResult<()> {
        let task = self.aggregator.apply_callback(&payload).await?;
        debug!("批次 {} 同步结果已应用: {}", task.composite_key(), task.status.as_str());
        Ok(())
    }

    async fn schedule_resend(
        self: &Arc<Self>,
        session_id: &str,
        batch_index: u32,
        payload: &CallbackPayload,
    ) -> DispatchResult<Option<ServerTask>> {
        let Some(task) = self.stores.tasks.get(session_id, batch_index).await? else {
            return Err(DispatchError::TaskNotFound {
                session_id: session_id.to_string(),
                batch_index,
            });
        };
        if task.status.is_terminal() || task.retry_count >= self.config.max_server_retries {
            return Ok(None);
        }
        let Some(job) = self.stores.jobs.get(session_id).await? else {
            return Ok(None);
        };
        if job.is_terminal() || self.registry.is_cancelled(session_id).await {
            return Ok(None);
        }
        let servers = self.available_servers().await?;
        if servers.is_empty() {
            return Ok(None);
        }

        self.aggregator.account_key_usage(&payload.api_key_usage).await;

        let failed_values: HashSet<&str> = payload.failed_keys().map(|u| u.api_key.as_str()).collect();
        let excluded: HashSet<String> = self
            .key_pool
            .store()
            .list()
            .await?
            .into_iter()
            .filter(|k| failed_values.contains(k.key.as_str()))
            .map(|k| k.resource_id().to_string())
            .collect();

        info!(
            "批次 {} 报告 {} 个失败密钥，换密钥重发",
            task.composite_key(),
            excluded.len()
        );
        let distributor = Arc::clone(self);
        let pending = task.clone();
        tokio::spawn(async move {
            match distributor.resend(&job, &pending, &servers, &excluded).await {
                Ok(_) => {}
                Err(e) => error!("重发批次 {} 出错: {}", pending.composite_key(), e),
            }
            if let Err(e) = distributor.aggregator.recompute(&job.session_id).await {
                error!("汇总任务 {} 失败: {}", job.session_id, e);
            }
        });
        Ok(Some(task))
    }
}
