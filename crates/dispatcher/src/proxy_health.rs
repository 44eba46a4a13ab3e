use std::sync::Arc;

use subtitle_core::{DispatchError, DispatchResult, ProxyConfig};
use subtitle_domain::{PooledResource, Proxy, ResourceStore, PERMANENT_MARKER};
use subtitle_infrastructure::DispatchMetrics;
use tracing::{debug, error, warn};

/// 代理故障类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFailureKind {
    /// 认证失败、拒绝连接等，立即禁用
    Critical,
    /// 超时、连接重置等偶发错误，使用更高的禁用阈值
    Intermittent,
    Normal,
}

impl ProxyFailureKind {
    pub fn classify(error: &DispatchError) -> Self {
        let message = error.to_string().to_lowercase();
        const CRITICAL: [&str; 4] = ["407", "proxy authentication", "connection refused", "invalid proxy"];
        const INTERMITTENT: [&str; 4] = ["timed out", "timeout", "connection reset", "broken pipe"];

        if CRITICAL.iter().any(|p| message.contains(p)) {
            ProxyFailureKind::Critical
        } else if matches!(error, DispatchError::Timeout(_))
            || INTERMITTENT.iter().any(|p| message.contains(p))
        {
            ProxyFailureKind::Intermittent
        } else {
            ProxyFailureKind::Normal
        }
    }
}

/// 代理健康跟踪
pub struct ProxyHealth {
    store: Arc<dyn ResourceStore<Proxy>>,
    config: ProxyConfig,
    metrics: DispatchMetrics,
}

impl ProxyHealth {
    pub fn new(store: Arc<dyn ResourceStore<Proxy>>, config: Option<ProxyConfig>) -> Self {
        Self {
            store,
            config: config.unwrap_or_default(),
            metrics: DispatchMetrics::new(),
        }
    }

    fn truncate_reason(&self, reason: &str) -> String {
        reason.chars().take(self.config.max_reason_length).collect()
    }

    pub async fn record_success(&self, proxy_id: &str) -> DispatchResult<()> {
        self.store
            .update_state(
                proxy_id,
                Box::new(|state| {
                    state.consecutive_failures = 0;
                    state.total_success += 1;
                }),
            )
            .await?;
        Ok(())
    }

    /// 记录一次失败，达到阈值时禁用；返回代理是否因此被禁用
    pub async fn record_failure(
        &self,
        proxy_id: &str,
        reason: &str,
        kind: ProxyFailureKind,
    ) -> DispatchResult<bool> {
        if kind == ProxyFailureKind::Critical {
            self.disable_immediately(proxy_id, reason).await?;
            return Ok(true);
        }

        let threshold = match kind {
            ProxyFailureKind::Intermittent => self.config.intermittent_failure_threshold,
            _ => self.config.failure_threshold,
        };
        let reason = self.truncate_reason(reason);
        let detail = reason.clone();

        let before = self.require(proxy_id).await?;
        let state = self
            .store
            .update_state(
                proxy_id,
                Box::new(move |state| {
                    state.consecutive_failures += 1;
                    state.total_failures += 1;
                    if state.enabled && state.consecutive_failures >= threshold {
                        state.enabled = false;
                        state.disabled_reason = Some(format!(
                            "{PERMANENT_MARKER} 连续失败 {} 次: {}",
                            state.consecutive_failures, detail
                        ));
                    }
                }),
            )
            .await?;

        let disabled = before.state.enabled && !state.enabled;
        if disabled {
            error!(
                "代理 {} 连续失败 {} 次，已禁用: {}",
                before.display_name(),
                state.consecutive_failures,
                reason
            );
            self.metrics.resource_disabled("proxy", "failures");
        } else {
            debug!(
                "代理 {} 失败 {}/{}: {}",
                before.display_name(),
                state.consecutive_failures,
                threshold,
                reason
            );
        }
        Ok(disabled)
    }

    pub async fn disable_immediately(&self, proxy_id: &str, reason: &str) -> DispatchResult<()> {
        let proxy = self.require(proxy_id).await?;
        let reason = self.truncate_reason(reason);
        let detail = reason.clone();
        self.store
            .update_state(
                proxy_id,
                Box::new(move |state| {
                    state.enabled = false;
                    state.total_failures += 1;
                    state.disabled_reason = Some(format!("{PERMANENT_MARKER} {detail}"));
                }),
            )
            .await?;
        warn!("代理 {} 出现严重错误，立即禁用: {}", proxy.display_name(), reason);
        self.metrics.resource_disabled("proxy", "critical");
        Ok(())
    }

    async fn require(&self, proxy_id: &str) -> DispatchResult<Proxy> {
        self.store
            .get(proxy_id)
            .await?
            .ok_or_else(|| DispatchError::ResourceNotFound {
                id: proxy_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtitle_domain::ProxyScheme;
    use subtitle_infrastructure::InMemoryResourceStore;

    async fn health() -> (ProxyHealth, Arc<InMemoryResourceStore<Proxy>>) {
        let store = Arc::new(
            InMemoryResourceStore::with_resources(vec![Proxy::new(ProxyScheme::Socks5, "1.2.3.4", 1080)])
                .await,
        );
        (ProxyHealth::new(store.clone(), None), store)
    }

    #[test]
    fn test_classify() {
        let refused = DispatchError::TransportFailure("tcp connect error: Connection refused".into());
        assert_eq!(ProxyFailureKind::classify(&refused), ProxyFailureKind::Critical);
        let timeout = DispatchError::Timeout("30s".into());
        assert_eq!(ProxyFailureKind::classify(&timeout), ProxyFailureKind::Intermittent);
        let other = DispatchError::TransportFailure("dns error".into());
        assert_eq!(ProxyFailureKind::classify(&other), ProxyFailureKind::Normal);
    }

    #[tokio::test]
    async fn test_disabled_after_threshold() {
        let (health, store) = health().await;
        for _ in 0..4 {
            assert!(!health.record_failure("1.2.3.4:1080", "dns", ProxyFailureKind::Normal).await.unwrap());
        }
        assert!(health.record_failure("1.2.3.4:1080", "dns", ProxyFailureKind::Normal).await.unwrap());

        let proxy = store.get("1.2.3.4:1080").await.unwrap().unwrap();
        assert!(proxy.state.is_permanently_disabled());
    }

    #[tokio::test]
    async fn test_success_resets_and_intermittent_threshold() {
        let (health, store) = health().await;
        for _ in 0..4 {
            health.record_failure("1.2.3.4:1080", "x", ProxyFailureKind::Normal).await.unwrap();
        }
        health.record_success("1.2.3.4:1080").await.unwrap();
        for _ in 0..9 {
            assert!(!health
                .record_failure("1.2.3.4:1080", "timeout", ProxyFailureKind::Intermittent)
                .await
                .unwrap());
        }
        let proxy = store.get("1.2.3.4:1080").await.unwrap().unwrap();
        assert!(proxy.state.enabled);
        assert_eq!(proxy.state.consecutive_failures, 9);
        assert_eq!(proxy.state.total_success, 1);
    }

    #[tokio::test]
    async fn test_reason_truncated() {
        let (health, store) = health().await;
        let long = "e".repeat(2000);
        health
            .record_failure("1.2.3.4:1080", &long, ProxyFailureKind::Critical)
            .await
            .unwrap();
        let proxy = store.get("1.2.3.4:1080").await.unwrap().unwrap();
        let reason = proxy.state.disabled_reason.unwrap();
        assert_eq!(reason.chars().count(), PERMANENT_MARKER.len() + 1 + 500);
    }
}
