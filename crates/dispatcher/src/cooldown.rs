//! 资源冷却管理
//!
//! 连续失败次数决定冷却时长：30秒、2分钟、5分钟、15分钟，第5次及以后固定30分钟。
//! 成功使用不会清零失败计数，只有显式重置才会清零。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{PooledResource, ResourceStore, COOLDOWN_MARKER, PERMANENT_MARKER};
use subtitle_infrastructure::DispatchMetrics;
use tracing::{debug, info, warn};

const COOLDOWN_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(2 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

pub const MAX_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// 第 `consecutive_failures` 次连续失败对应的冷却时长
pub fn cooldown_duration(consecutive_failures: u32) -> Duration {
    match consecutive_failures {
        0 => Duration::ZERO,
        n => COOLDOWN_SCHEDULE
            .get(n as usize - 1)
            .copied()
            .unwrap_or(MAX_COOLDOWN),
    }
}

/// 冷却中的资源
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownEntry {
    pub id: String,
    pub display_name: String,
    pub cooldown_until: DateTime<Utc>,
    pub consecutive_failures: u32,
}

pub struct CooldownManager<R: PooledResource> {
    name: String,
    store: Arc<dyn ResourceStore<R>>,
    metrics: DispatchMetrics,
}

impl<R: PooledResource> CooldownManager<R> {
    pub fn new(name: impl Into<String>, store: Arc<dyn ResourceStore<R>>) -> Self {
        Self {
            name: name.into(),
            store,
            metrics: DispatchMetrics::new(),
        }
    }

    async fn require(&self, id: &str) -> DispatchResult<R> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::ResourceNotFound { id: id.to_string() })
    }

    /// 记录一次失败并进入冷却，返回本次冷却时长
    pub async fn set_cooldown(&self, id: &str, detail: &str) -> DispatchResult<Duration> {
        let resource = self.require(id).await?;
        let now = Utc::now();
        let detail = detail.to_string();

        let state = self
            .store
            .update_state(
                id,
                Box::new(move |state| {
                    state.consecutive_failures += 1;
                    state.total_failures += 1;
                    let duration = cooldown_duration(state.consecutive_failures);
                    state.cooldown_until = Some(now + chrono::Duration::seconds(duration.as_secs() as i64));
                    // 已禁用的资源保留原有的禁用原因
                    if state.enabled {
                        state.disabled_reason = Some(format!(
                            "{COOLDOWN_MARKER} {}s] {} (#{})",
                            duration.as_secs(),
                            detail,
                            state.consecutive_failures
                        ));
                    }
                }),
            )
            .await?;

        let duration = cooldown_duration(state.consecutive_failures);
        warn!(
            "{} {} 进入冷却 {} 秒（连续失败 {} 次）",
            self.name,
            resource.display_name(),
            duration.as_secs(),
            state.consecutive_failures
        );
        self.metrics.cooldown_applied(state.consecutive_failures);
        Ok(duration)
    }

    pub async fn is_in_cooldown(&self, id: &str) -> DispatchResult<bool> {
        let resource = self.require(id).await?;
        Ok(resource.state().in_cooldown(Utc::now()))
    }

    /// 显式重置：清除冷却和连续失败计数
    pub async fn reset_cooldown(&self, id: &str) -> DispatchResult<()> {
        let resource = self.require(id).await?;
        self.store
            .update_state(
                id,
                Box::new(|state| {
                    state.consecutive_failures = 0;
                    state.cooldown_until = None;
                    if state
                        .disabled_reason
                        .as_deref()
                        .is_some_and(|r| r.starts_with(COOLDOWN_MARKER))
                    {
                        state.disabled_reason = None;
                    }
                }),
            )
            .await?;
        info!("{} {} 冷却已重置", self.name, resource.display_name());
        Ok(())
    }

    /// 清除已到期的冷却，返回处理的数量
    ///
    /// 只清除冷却时间和冷却原因，失败计数与永久禁用状态保持不变。
    pub async fn process_expired(&self) -> DispatchResult<usize> {
        let now = Utc::now();
        let mut expired = 0;

        for resource in self.store.list().await? {
            let due = resource.state().cooldown_until.is_some_and(|until| until <= now);
            if !due {
                continue;
            }
            let state = self
                .store
                .update_state(
                    resource.resource_id(),
                    Box::new(move |state| {
                        if state.cooldown_until.is_some_and(|until| until <= now) {
                            state.cooldown_until = None;
                            if state
                                .disabled_reason
                                .as_deref()
                                .is_some_and(|r| r.starts_with(COOLDOWN_MARKER))
                            {
                                state.disabled_reason = None;
                            }
                        }
                    }),
                )
                .await?;
            if state.cooldown_until.is_none() {
                expired += 1;
                debug!("{} {} 冷却已到期", self.name, resource.display_name());
            }
        }

        if expired > 0 {
            info!("{} 共 {} 个资源冷却到期", self.name, expired);
        }
        Ok(expired)
    }

    /// 永久禁用，需要外部操作才能恢复
    pub async fn disable_permanently(&self, id: &str, reason: &str) -> DispatchResult<()> {
        let resource = self.require(id).await?;
        let reason = reason.to_string();
        let logged = reason.clone();
        self.store
            .update_state(
                id,
                Box::new(move |state| {
                    state.enabled = false;
                    state.disabled_reason = Some(format!("{PERMANENT_MARKER} {reason}"));
                    state.cooldown_until = None;
                    state.consecutive_failures = 0;
                }),
            )
            .await?;
        warn!("{} {} 已被永久禁用: {}", self.name, resource.display_name(), logged);
        self.metrics.resource_disabled(&self.name, "permanent");
        Ok(())
    }

    pub async fn keys_in_cooldown(&self) -> DispatchResult<Vec<CooldownEntry>> {
        let now = Utc::now();
        let mut entries: Vec<CooldownEntry> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter_map(|r| {
                let until = r.state().cooldown_until.filter(|u| *u > now)?;
                Some(CooldownEntry {
                    id: r.resource_id().to_string(),
                    display_name: r.display_name(),
                    cooldown_until: until,
                    consecutive_failures: r.state().consecutive_failures,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.cooldown_until);
        Ok(entries)
    }
}
