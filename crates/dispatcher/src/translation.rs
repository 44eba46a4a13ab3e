//! 单进程翻译路径
//!
//! 不经过远程Worker，直接使用资源池中的密钥和代理调用上游模型。
//! 请求未到达上游时提前释放名额，不消耗配额；到达上游后无论成败都计入用量。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use subtitle_core::{DispatchError, DispatchResult, DistributionConfig, TranslationConfig};
use subtitle_domain::{
    line_errors, ApiKey, Job, JobRepository, JobStatus, Proxy, QuotaLedger, SubmitRequest, SubtitleLine, TranslatedLine, UpstreamModel, UpstreamRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch_planner::{plan, BatchSpan};
use crate::cancellation::CancellationRegistry;
use crate::cooldown::CooldownManager;
use crate::proxy_health::{ProxyFailureKind, ProxyHealth};
use crate::refund::RefundBook;
use crate::resource_pool::{ResourcePool, Slot};

#[derive(Debug, Clone)]
pub struct TranslatorSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub batch_size: u32,
    pub merge_threshold: u32,
    /// 等待密钥或代理名额的最长时间
    pub acquire_timeout: Duration,
    pub job_timeout: Duration,
    pub default_model: String,
    pub thinking_budget: Option<u32>,
}

impl TranslatorSettings {
    pub fn from_config(translation: &TranslationConfig, distribution: &DistributionConfig) -> Self {
        Self {
            max_retries: translation.max_retries,
            retry_delay: Duration::from_millis(translation.retry_delay_ms),
            batch_size: translation.batch_size,
            merge_threshold: distribution.merge_batch_threshold,
            acquire_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(distribution.job_timeout_minutes * 60),
            default_model: distribution.default_model.clone(),
            thinking_budget: distribution.thinking_budget,
        }
    }
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self::from_config(&TranslationConfig::default(), &DistributionConfig::default())
    }
}

/// 单进程翻译器使用的资源
pub struct TranslatorResources {
    pub key_pool: Arc<ResourcePool<ApiKey>>,
    pub proxy_pool: Arc<ResourcePool<Proxy>>,
    pub key_cooldown: Arc<CooldownManager<ApiKey>>,
    pub proxy_health: Arc<ProxyHealth>,
}

pub struct DirectTranslator {
    settings: TranslatorSettings,
    resources: TranslatorResources,
    jobs: Arc<dyn JobRepository>,
    quota: Arc<dyn QuotaLedger>,
    refunds: Arc<RefundBook>,
    registry: Arc<CancellationRegistry>,
    model: Arc<dyn UpstreamModel>,
}

/// 一次上游调用占用的资源
struct Lease {
    key: ApiKey,
    key_slot: Slot,
    proxy: Option<(Proxy, Slot)>,
}

impl DirectTranslator {
    pub fn new(
        settings: Option<TranslatorSettings>,
        resources: TranslatorResources,
        jobs: Arc<dyn JobRepository>,
        quota: Arc<dyn QuotaLedger>,
        refunds: Arc<RefundBook>,
        registry: Arc<CancellationRegistry>,
        model: Arc<dyn UpstreamModel>,
    ) -> Self {
        Self {
            settings: settings.unwrap_or_default(),
            resources,
            jobs,
            quota,
            refunds,
            registry,
            model,
        }
    }

    /// 在当前进程内完成整个翻译任务，返回终态任务
    pub async fn translate(&self, owner_id: &str, request: SubmitRequest) -> DispatchResult<Job> {
        if request.session_id.trim().is_empty() {
            return Err(DispatchError::InvalidInput("会话ID不能为空".to_string()));
        }
        if request.lines.is_empty() {
            return Err(DispatchError::InvalidInput("字幕行不能为空".to_string()));
        }

        let requested = request.lines.len() as u32;
        let granted = self.quota.charge(owner_id, requested).await?;
        if granted == 0 {
            return Err(DispatchError::InsufficientQuota {
                requested,
                remaining: 0,
            });
        }

        let mut lines = request.lines;
        lines.truncate(granted as usize);
        let model = request
            .model
            .unwrap_or_else(|| self.settings.default_model.clone());
        let mut job = Job::new(request.session_id.trim(), owner_id, lines, request.prompt, model)
            .with_system_instruction(request.system_instruction)
            .with_callback_url(request.callback_url);
        job.status = JobStatus::Processing;
        let batches = plan(granted, self.settings.batch_size, self.settings.merge_threshold);
        job.batch_count = batches.len() as u32;

        if let Err(e) = self.jobs.insert(job.clone()).await {
            self.refunds.refund_charge(owner_id, granted).await?;
            return Err(e);
        }
        let session_id = job.session_id.clone();
        // 超时由登记的看门狗负责强制失败
        let token = self
            .registry
            .register(&session_id, owner_id, self.settings.job_timeout)
            .await;

        info!("单进程翻译任务 {}: {} 行，{} 个批次", session_id, granted, batches.len());
        let (results, abort) = match self.run_batches(&job, &batches, &token).await {
            Ok(results) => (results, None),
            Err((results, e)) => {
                error!("单进程翻译任务 {} 中止: {}", session_id, e);
                (results, Some(format!("翻译中止: {e}")))
            }
        };

        let successes = results.iter().filter(|l| l.is_success()).count() as u32;
        let status = if abort.is_some() {
            JobStatus::Failed
        } else if successes == granted {
            JobStatus::Completed
        } else if successes > 0 {
            JobStatus::PartialCompleted
        } else {
            JobStatus::Failed
        };
        let error = abort.or_else(|| (successes < granted).then(|| format!("{} 行翻译失败", granted - successes)));

        self.registry.unregister(&session_id, owner_id).await;
        let (job, changed) = self
            .jobs
            .modify(
                &session_id,
                Box::new(move |job| {
                    if job.is_terminal() {
                        return false;
                    }
                    job.update_progress(successes);
                    job.results = results;
                    job.finish(status, error)
                }),
            )
            .await?;

        if changed {
            self.refunds.refund_unfinished(&session_id).await?;
            info!(
                "单进程翻译任务 {} 结束: {}（{}/{} 行）",
                session_id, job.status, job.completed_lines, job.total_lines
            );
        }
        Ok(job)
    }

    /// 依次翻译所有批次；中途出错时连同已得到的结果一起返回
    async fn run_batches(
        &self,
        job: &Job,
        batches: &[BatchSpan],
        token: &CancellationToken,
    ) -> Result<Vec<TranslatedLine>, (Vec<TranslatedLine>, DispatchError)> {
        let mut results = Vec::with_capacity(job.lines.len());
        for span in batches {
            let Some(batch) = job.lines.get(span.range()) else {
                continue;
            };
            match self.translate_batch(job, span.batch_index, batch, token).await {
                Ok(translated) => results.extend(translated),
                Err(e) => return Err((results, e)),
            }

            let done = results.iter().filter(|l| l.is_success()).count() as u32;
            if let Err(e) = self
                .jobs
                .modify(
                    &job.session_id,
                    Box::new(move |job| {
                        if job.is_terminal() {
                            return false;
                        }
                        job.update_progress(done);
                        true
                    }),
                )
                .await
            {
                warn!("更新任务 {} 进度失败: {}", job.session_id, e);
            }
        }
        Ok(results)
    }

    /// 翻译一个批次，所有尝试失败时返回标记为失败的行
    pub async fn translate_batch(
        &self,
        job: &Job,
        batch_index: u32,
        lines: &[SubtitleLine],
        token: &CancellationToken,
    ) -> DispatchResult<Vec<TranslatedLine>> {
        let session_id = job.session_id.as_str();
        let request = UpstreamRequest {
            model: job.model.clone(),
            prompt: job.instruction.clone(),
            system_instruction: job.system_instruction.clone(),
            lines: lines.to_vec(),
            thinking_budget: self.settings.thinking_budget,
        };

        let mut tried_keys: HashSet<String> = HashSet::new();
        let mut failed_proxies: HashSet<String> = HashSet::new();

        for attempt in 1..=self.settings.max_retries {
            if token.is_cancelled() {
                info!("任务 {} 已取消，批次 {} 不再重试", session_id, batch_index);
                return Ok(fail_all(lines, line_errors::CANCELLED));
            }

            let request_id = format!("{session_id}_b{batch_index}_a{attempt}");
            let lease = match self.lease(&request_id, &tried_keys, &failed_proxies).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!("批次 {} 第 {} 次尝试未取得资源", batch_index, attempt);
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
                Err(DispatchError::ResourceExhausted(reason)) => {
                    warn!("批次 {} 没有可用资源，停止重试: {}", batch_index, reason);
                    break;
                }
                Err(e) => return Err(e),
            };

            let proxy = lease.proxy.as_ref().map(|(p, _)| p);
            match self.model.generate(&request, &lease.key, proxy).await {
                Ok(output) => {
                    self.settle_reached(&lease).await;
                    if let Err(e) = self
                        .resources
                        .key_pool
                        .store()
                        .update_state(&lease.key.id, Box::new(|s| s.total_success += 1))
                        .await
                    {
                        warn!("记录密钥 {} 成功次数失败: {}", lease.key.masked_key(), e);
                    }
                    return Ok(parse_model_output(lines, &output));
                }
                Err(e) if e.is_transport() => {
                    // 请求未到达上游：名额提前归还，不计配额
                    self.resources.key_pool.release(&lease.key_slot);
                    if let Some((proxy, slot)) = &lease.proxy {
                        self.resources.proxy_pool.release(slot);
                        if let Err(err) = self
                            .resources
                            .proxy_health
                            .record_failure(&proxy.id, &e.to_string(), ProxyFailureKind::classify(&e))
                            .await
                        {
                            warn!("记录代理 {} 失败状态失败: {}", proxy.id, err);
                        }
                        failed_proxies.insert(proxy.id.clone());
                    }
                    warn!("批次 {} 第 {} 次尝试传输失败: {}", batch_index, attempt, e);
                }
                Err(e) => {
                    self.settle_reached(&lease).await;
                    tried_keys.insert(lease.key.id.clone());
                    let detail = e.to_string();
                    if e.is_rate_limited() {
                        if let Err(err) = self.resources.key_cooldown.set_cooldown(&lease.key.id, &detail).await {
                            warn!("设置密钥 {} 冷却失败: {}", lease.key.masked_key(), err);
                        }
                        tokio::time::sleep(self.settings.retry_delay).await;
                    } else if e.is_auth_failure() {
                        if let Err(err) = self
                            .resources
                            .key_cooldown
                            .disable_permanently(&lease.key.id, &detail)
                            .await
                        {
                            warn!("禁用密钥 {} 失败: {}", lease.key.masked_key(), err);
                        }
                    } else {
                        tokio::time::sleep(self.settings.retry_delay * attempt).await;
                    }
                    warn!("批次 {} 第 {} 次尝试上游失败: {}", batch_index, attempt, detail);
                }
            }
        }

        warn!("批次 {} 重试耗尽", batch_index);
        Ok(fail_all(lines, line_errors::MAX_RETRIES_EXCEEDED))
    }

    async fn lease(
        &self,
        request_id: &str,
        excluded_keys: &HashSet<String>,
        excluded_proxies: &HashSet<String>,
    ) -> DispatchResult<Option<Lease>> {
        let timeout = self.settings.acquire_timeout;
        let Some((key, key_slot)) = self
            .resources
            .key_pool
            .acquire_with_timeout(request_id, excluded_keys, timeout)
            .await?
        else {
            return Ok(None);
        };

        let has_proxies = !self.resources.proxy_pool.store().list().await?.is_empty();
        if !has_proxies {
            return Ok(Some(Lease {
                key,
                key_slot,
                proxy: None,
            }));
        }

        match self
            .resources
            .proxy_pool
            .acquire_with_timeout(request_id, excluded_proxies, timeout)
            .await
        {
            Ok(Some(proxy)) => Ok(Some(Lease {
                key,
                key_slot,
                proxy: Some(proxy),
            })),
            Ok(None) => {
                self.resources.key_pool.release(&key_slot);
                Ok(None)
            }
            Err(e) => {
                self.resources.key_pool.release(&key_slot);
                Err(e)
            }
        }
    }

    /// 请求已到达上游：名额保持到窗口结束并计入用量
    async fn settle_reached(&self, lease: &Lease) {
        self.resources.key_pool.mark_used(&lease.key_slot);
        if let Err(e) = self
            .resources
            .key_pool
            .mark_usage_and_maybe_disable(&lease.key.id)
            .await
        {
            warn!("记录密钥 {} 用量失败: {}", lease.key.masked_key(), e);
        }
        if let Some((proxy, slot)) = &lease.proxy {
            self.resources.proxy_pool.mark_used(slot);
            if let Err(e) = self.resources.proxy_pool.record_usage(&proxy.id, 1).await {
                warn!("记录代理 {} 用量失败: {}", proxy.id, e);
            }
            if let Err(e) = self.resources.proxy_health.record_success(&proxy.id).await {
                warn!("记录代理 {} 状态失败: {}", proxy.id, e);
            }
        }
    }
}

fn fail_all(lines: &[SubtitleLine], error_type: &str) -> Vec<TranslatedLine> {
    lines
        .iter()
        .map(|l| TranslatedLine::failed(l, error_type))
        .collect()
}

/// 解析 `N: text` 格式的模型输出，缺失的行标记为失败
pub fn parse_model_output(lines: &[SubtitleLine], output: &str) -> Vec<TranslatedLine> {
    let mut translated: HashMap<u32, String> = HashMap::new();
    for raw in output.lines() {
        let Some((index, text)) = raw.trim().split_once(':') else {
            continue;
        };
        if let Ok(index) = index.trim().parse::<u32>() {
            translated.entry(index).or_insert_with(|| text.trim().to_string());
        }
    }

    lines
        .iter()
        .map(|line| match translated.remove(&line.index) {
            Some(text) if !text.is_empty() => TranslatedLine::success(line.index, line.text.clone(), text),
            _ => TranslatedLine::failed(line, line_errors::MISSING_LINE),
        })
        .collect()
}
