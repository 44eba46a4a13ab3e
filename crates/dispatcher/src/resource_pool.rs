//! 受速率限制的资源池
//!
//! 每个资源（API密钥或代理）对应一个计数信号量，容量等于每分钟请求上限。
//! 获取到的名额在速率窗口结束后自动归还，调用方是否显式释放都不影响这一点；
//! 请求未到达上游时调用方应提前释放，此时不计入速率和每日配额。
//!
//! 容量变更时直接替换信号量：旧名额的持有者仍引用旧信号量，归还到旧信号量即可，
//! 新的获取使用新信号量，不会出现死锁。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use subtitle_core::{DailyClock, DispatchError, DispatchResult, RateLimitConfig};
use subtitle_domain::{PooledResource, ResourceState, ResourceStore, DAILY_LIMIT_MARKER};
use subtitle_infrastructure::DispatchMetrics;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 资源池配置
#[derive(Debug, Clone)]
pub struct ResourcePoolConfig {
    /// 池名称，用于日志和指标
    pub name: String,
    /// 速率窗口
    pub window: Duration,
    /// 资源未单独配置时的每分钟上限
    pub default_rpm: u32,
    /// 等待超过该值的获取会被记录
    pub slow_acquire_threshold: Duration,
}

impl ResourcePoolConfig {
    pub fn for_api_keys(config: &RateLimitConfig) -> Self {
        Self {
            name: "api_key".to_string(),
            window: Duration::from_secs(config.window_seconds),
            default_rpm: config.default_key_rpm,
            slow_acquire_threshold: Duration::from_millis(config.slow_acquire_log_ms),
        }
    }

    pub fn for_proxies(config: &RateLimitConfig) -> Self {
        Self {
            name: "proxy".to_string(),
            window: Duration::from_secs(config.window_seconds),
            default_rpm: config.default_proxy_rpm,
            slow_acquire_threshold: Duration::from_millis(config.slow_acquire_log_ms),
        }
    }
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            name: "resource".to_string(),
            window: Duration::from_secs(60),
            default_rpm: 10,
            slow_acquire_threshold: Duration::from_millis(100),
        }
    }
}

/// 资源当前的速率状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: u32,
    pub available: u32,
    pub active: u32,
}

/// 一次获准的请求名额，只会被归还一次
#[derive(Debug)]
pub struct Slot {
    id: String,
    resource_id: String,
    inner: Arc<SlotInner>,
}

#[derive(Debug)]
struct SlotInner {
    permit: std::sync::Mutex<Option<OwnedSemaphorePermit>>,
    auto_release: CancellationToken,
}

impl SlotInner {
    /// 归还名额，已归还时返回false
    fn release_permit(&self) -> bool {
        let permit = match self.permit.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        permit.is_some()
    }
}

impl Slot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn is_released(&self) -> bool {
        match self.inner.permit.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    /// 自动释放任务是否已被取消（提前释放时取消）
    pub fn auto_release_cancelled(&self) -> bool {
        self.inner.auto_release.is_cancelled()
    }
}

#[derive(Debug)]
struct Limiter {
    capacity: u32,
    semaphore: Arc<Semaphore>,
}

impl Limiter {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity.max(1) as usize)),
        }
    }
}

/// 通用资源池
pub struct ResourcePool<R: PooledResource> {
    config: ResourcePoolConfig,
    store: Arc<dyn ResourceStore<R>>,
    clock: DailyClock,
    limiters: RwLock<HashMap<String, Limiter>>,
    default_rpm: AtomicU32,
    metrics: DispatchMetrics,
}

impl<R: PooledResource> ResourcePool<R> {
    pub fn new(store: Arc<dyn ResourceStore<R>>, clock: DailyClock, config: ResourcePoolConfig) -> Self {
        let default_rpm = AtomicU32::new(config.default_rpm.max(1));
        Self {
            config,
            store,
            clock,
            limiters: RwLock::new(HashMap::new()),
            default_rpm,
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore<R>> {
        &self.store
    }

    pub fn clock(&self) -> DailyClock {
        self.clock
    }

    /// 修改全局默认RPM，未单独配置的资源在下一次获取时切换到新容量
    pub fn set_default_rpm(&self, rpm: u32) {
        let previous = self.default_rpm.swap(rpm.max(1), Ordering::Relaxed);
        if previous != rpm {
            info!("{} 资源池默认RPM变更: {} -> {}", self.config.name, previous, rpm);
        }
    }

    fn capacity_for(&self, resource: &R) -> u32 {
        resource
            .rpm_limit()
            .unwrap_or_else(|| self.default_rpm.load(Ordering::Relaxed))
            .max(1)
    }

    /// 取得资源对应的信号量，容量与当前设置不一致时替换
    async fn semaphore_for(&self, resource: &R) -> Arc<Semaphore> {
        let capacity = self.capacity_for(resource);
        let id = resource.resource_id();

        if let Some(limiter) = self.limiters.read().await.get(id) {
            if limiter.capacity == capacity {
                return limiter.semaphore.clone();
            }
        }

        let mut limiters = self.limiters.write().await;
        match limiters.get(id) {
            Some(limiter) if limiter.capacity == capacity => limiter.semaphore.clone(),
            Some(limiter) => {
                info!(
                    "{} {} RPM变更: {} -> {}，替换速率信号量",
                    self.config.name,
                    resource.display_name(),
                    limiter.capacity,
                    capacity
                );
                let limiter = Limiter::new(capacity);
                let semaphore = limiter.semaphore.clone();
                limiters.insert(id.to_string(), limiter);
                semaphore
            }
            None => {
                let limiter = Limiter::new(capacity);
                let semaphore = limiter.semaphore.clone();
                limiters.insert(id.to_string(), limiter);
                semaphore
            }
        }
    }

    /// 显式替换某个资源的容量
    pub async fn update_capacity(&self, resource_id: &str, rpm: u32) {
        let mut limiters = self.limiters.write().await;
        let previous = limiters.insert(resource_id.to_string(), Limiter::new(rpm.max(1)));
        info!(
            "{} {} 容量已更新: {:?} -> {}",
            self.config.name,
            resource_id,
            previous.map(|l| l.capacity),
            rpm
        );
    }

    /// 可选资源：启用、未冷却、未达每日上限且不在排除集合中，随机打乱
    async fn eligible(&self, excluded: &HashSet<String>) -> DispatchResult<Vec<R>> {
        let now = Utc::now();
        let mut candidates: Vec<R> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| !excluded.contains(r.resource_id()))
            .filter(|r| r.state().is_selectable(now, r.daily_limit()))
            .collect();
        candidates.shuffle(&mut rand::rng());
        Ok(candidates)
    }

    fn make_slot(&self, request_id: &str, resource: &R, permit: OwnedSemaphorePermit) -> Slot {
        let resource_id = resource.resource_id().to_string();
        let id = format!("{}_{}_{}", request_id, resource_id, uuid::Uuid::new_v4());
        let inner = Arc::new(SlotInner {
            permit: std::sync::Mutex::new(Some(permit)),
            auto_release: CancellationToken::new(),
        });

        let timer = inner.clone();
        let window = self.config.window;
        let pool_name = self.config.name.clone();
        let slot_id = id.clone();
        let metrics = self.metrics;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    if timer.release_permit() {
                        debug!("{} 名额 {} 已在速率窗口结束后自动释放", pool_name, slot_id);
                        metrics.slot_released(&pool_name, false);
                    }
                }
                _ = timer.auto_release.cancelled() => {}
            }
        });

        self.metrics.slot_acquired(&self.config.name);
        debug!("{} 获取名额 {} ({})", self.config.name, id, resource.display_name());
        Slot {
            id,
            resource_id,
            inner,
        }
    }

    /// 非阻塞获取：依次尝试每个可选资源，全部饱和时返回None
    pub async fn try_acquire(
        &self,
        request_id: &str,
        excluded: &HashSet<String>,
    ) -> DispatchResult<Option<(R, Slot)>> {
        for resource in self.eligible(excluded).await? {
            let semaphore = self.semaphore_for(&resource).await;
            if let Ok(permit) = semaphore.try_acquire_owned() {
                let slot = self.make_slot(request_id, &resource, permit);
                return Ok(Some((resource, slot)));
            }
        }
        Ok(None)
    }

    /// 阻塞获取：全部饱和时等待第一个候选资源的窗口释放
    ///
    /// 没有任何可选资源时返回 `ResourceExhausted`。
    pub async fn acquire(
        &self,
        request_id: &str,
        excluded: &HashSet<String>,
    ) -> DispatchResult<(R, Slot)> {
        loop {
            let candidates = self.eligible(excluded).await?;
            let Some(first) = candidates.first().cloned() else {
                return Err(DispatchError::ResourceExhausted(format!(
                    "{} 资源池没有可用资源",
                    self.config.name
                )));
            };

            for resource in &candidates {
                let semaphore = self.semaphore_for(resource).await;
                if let Ok(permit) = semaphore.try_acquire_owned() {
                    return Ok((resource.clone(), self.make_slot(request_id, resource, permit)));
                }
            }

            let started = Instant::now();
            let semaphore = self.semaphore_for(&first).await;
            let permit = semaphore.acquire_owned().await.map_err(|e| {
                DispatchError::Internal(format!("{} 速率信号量已关闭: {e}", self.config.name))
            })?;
            let waited = started.elapsed();
            if waited > self.config.slow_acquire_threshold {
                info!(
                    "{} 请求 {} 等待 {:?} 后获得 {} 的名额",
                    self.config.name,
                    request_id,
                    waited,
                    first.display_name()
                );
            }

            // 等待期间资源可能被冷却或禁用
            match self.store.get(first.resource_id()).await? {
                Some(current)
                    if current
                        .state()
                        .is_selectable(Utc::now(), current.daily_limit()) =>
                {
                    return Ok((current.clone(), self.make_slot(request_id, &current, permit)));
                }
                _ => {
                    debug!(
                        "{} {} 在等待期间变为不可用，重新选择",
                        self.config.name,
                        first.display_name()
                    );
                    drop(permit);
                }
            }
        }
    }

    /// 带超时的获取，超时返回None
    pub async fn acquire_with_timeout(
        &self,
        request_id: &str,
        excluded: &HashSet<String>,
        timeout: Duration,
    ) -> DispatchResult<Option<(R, Slot)>> {
        match tokio::time::timeout(timeout, self.acquire(request_id, excluded)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                debug!("{} 请求 {} 在 {:?} 内未获得名额", self.config.name, request_id, timeout);
                Ok(None)
            }
        }
    }

    /// 提前释放：请求未到达上游，名额立即归还且取消自动释放。重复释放无副作用
    pub fn release(&self, slot: &Slot) -> bool {
        slot.inner.auto_release.cancel();
        let released = slot.inner.release_permit();
        if released {
            debug!("{} 名额 {} 已提前释放", self.config.name, slot.id);
            self.metrics.slot_released(&self.config.name, true);
        }
        released
    }

    /// 请求已到达上游，名额保持占用直到速率窗口结束
    pub fn mark_used(&self, slot: &Slot) {
        debug!(
            "{} 名额 {} 已使用，将在 {:?} 后自动释放",
            self.config.name, slot.id, self.config.window
        );
    }

    /// 记录一次到达上游的请求，达到每日上限时禁用资源
    pub async fn mark_usage_and_maybe_disable(&self, resource_id: &str) -> DispatchResult<ResourceState> {
        self.record_usage(resource_id, 1).await
    }

    /// 记录若干次到达上游的请求（每日计数和累计计数），达到每日上限时禁用资源
    pub async fn record_usage(&self, resource_id: &str, requests: u32) -> DispatchResult<ResourceState> {
        let resource = self
            .store
            .get(resource_id)
            .await?
            .ok_or_else(|| DispatchError::ResourceNotFound {
                id: resource_id.to_string(),
            })?;
        let daily_limit = resource.daily_limit();
        let clock = self.clock;
        let now = Utc::now();

        let state = self
            .store
            .update_state(
                resource_id,
                Box::new(move |state| {
                    if clock.needs_reset(state.last_reset, now) {
                        state.requests_today = 0;
                        state.last_reset = Some(now);
                    }
                    state.requests_today = state.requests_today.saturating_add(requests);
                    state.total_requests += requests as u64;
                    if let Some(limit) = daily_limit {
                        if state.enabled && state.requests_today >= limit {
                            state.enabled = false;
                            state.disabled_reason =
                                Some(format!("{DAILY_LIMIT_MARKER} 已达到每日请求上限 {limit}"));
                        }
                    }
                }),
            )
            .await?;

        if state.is_daily_limited() {
            warn!(
                "{} {} 已达到每日上限 ({} 次)，暂时禁用至下一个自然日",
                self.config.name,
                resource.display_name(),
                state.requests_today
            );
            self.metrics.resource_disabled(&self.config.name, "daily_limit");
        }
        Ok(state)
    }

    /// 跨过自然日边界时重置每日计数，并重新启用因每日上限被禁用的资源
    pub async fn reset_daily(&self) -> DispatchResult<usize> {
        let now = Utc::now();
        let clock = self.clock;
        let mut reset = 0;

        for resource in self.store.list().await? {
            if !clock.needs_reset(resource.state().last_reset, now) {
                continue;
            }
            let state = self
                .store
                .update_state(
                    resource.resource_id(),
                    Box::new(move |state| {
                        if !clock.needs_reset(state.last_reset, now) {
                            return;
                        }
                        state.requests_today = 0;
                        state.last_reset = Some(now);
                        if state.is_daily_limited() {
                            state.enabled = true;
                            state.disabled_reason = None;
                        }
                    }),
                )
                .await?;
            if state.last_reset == Some(now) {
                reset += 1;
            }
        }

        if reset > 0 {
            info!("{} 资源池已重置 {} 个资源的每日计数", self.config.name, reset);
        }
        Ok(reset)
    }

    pub async fn status(&self, resource_id: &str) -> DispatchResult<PoolStatus> {
        if let Some(limiter) = self.limiters.read().await.get(resource_id) {
            let available = limiter.semaphore.available_permits() as u32;
            return Ok(PoolStatus {
                capacity: limiter.capacity,
                available,
                active: limiter.capacity.saturating_sub(available),
            });
        }

        let resource = self
            .store
            .get(resource_id)
            .await?
            .ok_or_else(|| DispatchError::ResourceNotFound {
                id: resource_id.to_string(),
            })?;
        let capacity = self.capacity_for(&resource);
        Ok(PoolStatus {
            capacity,
            available: capacity,
            active: 0,
        })
    }

    pub async fn available_slots(&self, resource_id: &str) -> DispatchResult<u32> {
        Ok(self.status(resource_id).await?.available)
    }

    pub async fn has_available_slot(&self, resource_id: &str) -> DispatchResult<bool> {
        Ok(self.available_slots(resource_id).await? > 0)
    }
}
