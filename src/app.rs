use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use subtitle_api::{create_app, AppState};
use subtitle_core::{AppConfig, DailyClock};
use subtitle_dispatcher::{
    CancellationRegistry, CooldownManager, DirectTranslator, DispatchStores, JobDistributor,
    MaintenanceSettings, ProxyHealth, RefundBook, ResourceMaintenance, ResourcePool,
    ResourcePoolConfig, ResultAggregator, TranslatorResources, TranslatorSettings,
};
use subtitle_domain::{parse_proxy_list, ApiKey, JobNotifier, Proxy, WorkerServer};
use subtitle_infrastructure::{
    InMemoryJobRepository, InMemoryQuotaLedger, InMemoryResourceStore, InMemoryTaskRepository,
    InMemoryWorkerServerRepository,
};
use subtitle_worker::{GeminiClient, GeminiSettings, HttpBatchSender, HttpJobNotifier};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info};

/// 主应用程序
///
/// 持有进程内的全部存储和组件，生命周期与进程相同。
pub struct Application {
    config: AppConfig,
    state: AppState,
    maintenance: Arc<ResourceMaintenance>,
}

impl Application {
    /// 按配置装配所有组件并载入资源种子
    pub async fn new(config: AppConfig, metrics_handle: Option<PrometheusHandle>) -> Result<Self> {
        info!("初始化应用程序");

        let clock = DailyClock::from_offset_hours(config.maintenance.timezone_offset_hours)
            .context("每日重置时区配置无效")?;

        let jobs = Arc::new(InMemoryJobRepository::new());
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let servers = Arc::new(InMemoryWorkerServerRepository::with_servers(seed_servers(&config)).await);
        let keys = Arc::new(InMemoryResourceStore::with_resources(seed_api_keys(&config)).await);
        let proxies = Arc::new(InMemoryResourceStore::with_resources(seed_proxies(&config)).await);
        let quota = Arc::new(InMemoryQuotaLedger::new(config.quota.daily_line_limit, clock));

        let key_pool = Arc::new(ResourcePool::new(
            keys.clone(),
            clock,
            ResourcePoolConfig::for_api_keys(&config.rate_limit),
        ));
        let proxy_pool = Arc::new(ResourcePool::new(
            proxies.clone(),
            clock,
            ResourcePoolConfig::for_proxies(&config.rate_limit),
        ));
        let key_cooldown = Arc::new(CooldownManager::new("api_key", keys.clone()));
        let proxy_cooldown = Arc::new(CooldownManager::new("proxy", proxies.clone()));
        let proxy_health = Arc::new(ProxyHealth::new(proxies.clone(), Some(config.proxy.clone())));

        let refunds = Arc::new(RefundBook::new(jobs.clone(), quota.clone()));
        let registry = Arc::new(CancellationRegistry::new(jobs.clone(), refunds.clone()));

        let notifier: Arc<dyn JobNotifier> = Arc::new(
            HttpJobNotifier::new(Duration::from_secs(config.api.request_timeout_seconds))
                .context("创建客户端回调通知器失败")?,
        );
        let aggregator = Arc::new(ResultAggregator::new(
            jobs.clone(),
            tasks.clone(),
            key_pool.clone(),
            key_cooldown.clone(),
            refunds.clone(),
            registry.clone(),
            Some(notifier),
        ));

        let sender = Arc::new(
            HttpBatchSender::from_config(&config.distribution).context("创建Worker发送客户端失败")?,
        );
        let distributor = Arc::new(JobDistributor::new(
            config.distribution.clone(),
            Some(config.api.callback_url()),
            DispatchStores {
                jobs: jobs.clone(),
                tasks,
                servers,
                quota: quota.clone(),
            },
            key_pool.clone(),
            refunds.clone(),
            registry.clone(),
            aggregator,
            sender,
        ));

        let model = Arc::new(
            GeminiClient::new(GeminiSettings::from_config(&config.translation, &config.proxy))
                .context("创建上游模型客户端失败")?,
        );
        let translator = Arc::new(DirectTranslator::new(
            Some(TranslatorSettings::from_config(&config.translation, &config.distribution)),
            TranslatorResources {
                key_pool: key_pool.clone(),
                proxy_pool: proxy_pool.clone(),
                key_cooldown: key_cooldown.clone(),
                proxy_health,
            },
            jobs.clone(),
            quota,
            refunds,
            registry,
            model,
        ));

        let maintenance = Arc::new(ResourceMaintenance::new(
            key_pool.clone(),
            proxy_pool,
            key_cooldown.clone(),
            proxy_cooldown,
            Some(MaintenanceSettings {
                interval: Duration::from_secs(config.maintenance.interval_seconds),
            }),
        ));

        let state = AppState {
            distributor,
            translator,
            jobs,
            key_pool,
            key_cooldown,
            metrics_handle,
        };

        Ok(Self {
            config,
            state,
            maintenance,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn maintenance(&self) -> &Arc<ResourceMaintenance> {
        &self.maintenance
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone(), self.config.api.cors_enabled)
    }

    /// 启动后台维护和HTTP服务，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", self.config.api.bind_address);

        let maintenance_handle = self.maintenance.start().await;

        let result = axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await;

        self.maintenance.stop().await;
        maintenance_handle.abort();

        if let Err(e) = result {
            error!("API服务器运行失败: {}", e);
            return Err(e).context("API服务器异常退出");
        }
        info!("API服务器已停止");
        Ok(())
    }
}

fn seed_servers(config: &AppConfig) -> Vec<WorkerServer> {
    config
        .resources
        .servers
        .iter()
        .map(|seed| {
            let mut server = WorkerServer::new(seed.id.clone(), seed.url.clone());
            if let Some(name) = &seed.name {
                server.name = name.clone();
            }
            server.priority = seed.priority;
            server.enabled = seed.enabled;
            server
        })
        .collect()
}

/// 未单独配置每日上限的密钥使用全局默认值
fn seed_api_keys(config: &AppConfig) -> Vec<ApiKey> {
    config
        .resources
        .api_keys
        .iter()
        .map(|seed| {
            let mut key = ApiKey::new(seed.id.clone(), seed.key.clone());
            key.rpm_limit = seed.rpm_limit;
            key.daily_limit = seed.daily_limit.or(config.rate_limit.default_key_daily_limit);
            key.state.enabled = seed.enabled;
            key
        })
        .collect()
}

/// 无效行由解析函数记录警告后跳过
fn seed_proxies(config: &AppConfig) -> Vec<Proxy> {
    parse_proxy_list(&config.resources.proxies)
}
