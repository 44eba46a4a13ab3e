use std::sync::Arc;
use std::time::Duration;

use subtitle_core::DispatchResult;
use subtitle_domain::{ApiKey, Proxy};
use tracing::{debug, error, info};

use crate::cooldown::CooldownManager;
use crate::resource_pool::ResourcePool;

/// 后台维护配置
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// 执行间隔
    pub interval: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// 单次维护的处理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_key_cooldowns: usize,
    pub expired_proxy_cooldowns: usize,
    pub reset_keys: usize,
    pub reset_proxies: usize,
}

/// 资源后台维护：冷却到期处理与每日计数重置
///
/// 与请求流量无关，按固定间隔运行；两次运行重叠时结果不变。
pub struct ResourceMaintenance {
    key_pool: Arc<ResourcePool<ApiKey>>,
    proxy_pool: Arc<ResourcePool<Proxy>>,
    key_cooldown: Arc<CooldownManager<ApiKey>>,
    proxy_cooldown: Arc<CooldownManager<Proxy>>,
    settings: MaintenanceSettings,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl ResourceMaintenance {
    pub fn new(
        key_pool: Arc<ResourcePool<ApiKey>>,
        proxy_pool: Arc<ResourcePool<Proxy>>,
        key_cooldown: Arc<CooldownManager<ApiKey>>,
        proxy_cooldown: Arc<CooldownManager<Proxy>>,
        settings: Option<MaintenanceSettings>,
    ) -> Self {
        Self {
            key_pool,
            proxy_pool,
            key_cooldown,
            proxy_cooldown,
            settings: settings.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    /// 执行一次维护
    pub async fn run_once(&self) -> DispatchResult<MaintenanceReport> {
        let report = MaintenanceReport {
            expired_key_cooldowns: self.key_cooldown.process_expired().await?,
            expired_proxy_cooldowns: self.proxy_cooldown.process_expired().await?,
            reset_keys: self.key_pool.reset_daily().await?,
            reset_proxies: self.proxy_pool.reset_daily().await?,
        };
        if report != MaintenanceReport::default() {
            debug!("资源维护完成: {:?}", report);
        }
        Ok(report)
    }

    async fn maintenance_loop(&self) {
        info!("启动资源维护循环，间隔 {:?}", self.settings.interval);

        loop {
            // 检查是否应该停止运行
            if !*self.running.read().await {
                info!("收到停止信号，退出资源维护循环");
                break;
            }

            if let Err(e) = self.run_once().await {
                error!("资源维护出错: {}", e);
            }

            tokio::time::sleep(self.settings.interval).await;
        }
    }

    /// 在后台启动维护循环
    pub async fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        let maintenance = Arc::clone(self);
        tokio::spawn(async move { maintenance.maintenance_loop().await })
    }

    pub async fn stop(&self) {
        info!("停止资源维护服务");
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
