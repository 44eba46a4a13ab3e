#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use subtitle_core::{DailyClock, DispatchError, DispatchResult, DistributionConfig, ProxyConfig};
use subtitle_dispatcher::{
    CancellationRegistry, CooldownManager, DispatchStores, JobDistributor, ProxyHealth, RefundBook,
    ResourcePool, ResourcePoolConfig, ResultAggregator,
};
use subtitle_domain::{
    ApiKey, BatchSender, CallbackPayload, ClientNotification, Job, JobNotifier, JobRepository,
    Proxy, SubmitRequest, SubtitleLine, TranslateRequest, TranslatedLine, UpstreamModel,
    UpstreamRequest, WorkerServer,
};
use subtitle_infrastructure::{
    InMemoryJobRepository, InMemoryQuotaLedger, InMemoryResourceStore, InMemoryTaskRepository,
    InMemoryWorkerServerRepository,
};

/// Worker对某个批次的响应方式
#[derive(Clone)]
pub enum SendBehavior {
    /// 接受请求，结果稍后通过回调返回
    Accept,
    /// 在响应体中直接返回全部译文
    Sync,
    /// 连接失败
    Refuse,
}

#[derive(Default)]
pub struct FakeSender {
    /// 按服务器ID配置行为，未配置时为 Accept
    pub behaviors: Mutex<HashMap<String, SendBehavior>>,
    pub sent: Mutex<Vec<(String, TranslateRequest)>>,
}

impl FakeSender {
    pub fn with_behavior(self, server_id: &str, behavior: SendBehavior) -> Self {
        self.behaviors.lock().unwrap().insert(server_id.to_string(), behavior);
        self
    }

    pub fn sent(&self) -> Vec<(String, TranslateRequest)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSender for FakeSender {
    async fn send_batch(
        &self,
        server: &WorkerServer,
        request: &TranslateRequest,
    ) -> DispatchResult<Option<CallbackPayload>> {
        self.sent
            .lock()
            .unwrap()
            .push((server.id.clone(), request.clone()));
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&server.id)
            .cloned()
            .unwrap_or(SendBehavior::Accept);
        match behavior {
            SendBehavior::Accept => Ok(None),
            SendBehavior::Sync => Ok(Some(completed_payload(request))),
            SendBehavior::Refuse => Err(DispatchError::TransportFailure(format!(
                "connection refused: {}",
                server.url
            ))),
        }
    }
}

pub fn translated(lines: &[SubtitleLine]) -> Vec<TranslatedLine> {
    lines
        .iter()
        .map(|l| TranslatedLine::success(l.index, l.text.clone(), format!("译:{}", l.text)))
        .collect()
}

pub fn completed_payload(request: &TranslateRequest) -> CallbackPayload {
    CallbackPayload {
        session_id: request.session_id.clone(),
        status: "completed".to_string(),
        total_lines: request.lines.len() as u32,
        completed_lines: request.lines.len() as u32,
        error: None,
        api_key_usage: Vec::new(),
        results: Some(translated(&request.lines)),
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(String, ClientNotification)>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn notify(&self, callback_url: &str, notification: &ClientNotification) -> DispatchResult<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((callback_url.to_string(), notification.clone()));
        Ok(())
    }
}

/// 上游模型的脚本化响应
#[derive(Clone)]
pub enum ModelReply {
    /// 按 `N: text` 返回每一行的译文
    Echo,
    Transport(String),
    Upstream(u16, String),
}

#[derive(Default)]
pub struct ScriptedModel {
    pub script: Mutex<VecDeque<ModelReply>>,
    /// 每次调用使用的 (密钥ID, 代理ID)
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamModel for ScriptedModel {
    async fn generate(
        &self,
        request: &UpstreamRequest,
        api_key: &ApiKey,
        proxy: Option<&Proxy>,
    ) -> DispatchResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push((api_key.id.clone(), proxy.map(|p| p.id.clone())));
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ModelReply::Echo);
        match reply {
            ModelReply::Echo => Ok(request
                .lines
                .iter()
                .map(|l| format!("{}: 译:{}", l.index, l.text))
                .collect::<Vec<_>>()
                .join("\n")),
            ModelReply::Transport(message) => Err(DispatchError::TransportFailure(message)),
            ModelReply::Upstream(status, message) => {
                Err(DispatchError::UpstreamFailure { status, message })
            }
        }
    }
}

pub fn lines(count: u32) -> Vec<SubtitleLine> {
    (1..=count)
        .map(|i| SubtitleLine::new(i, format!("line {i}")))
        .collect()
}

pub fn submit_request(session_id: &str, count: u32) -> SubmitRequest {
    SubmitRequest {
        session_id: session_id.to_string(),
        lines: lines(count),
        prompt: "翻译成中文".to_string(),
        system_instruction: None,
        model: None,
        callback_url: Some("http://client/notify".to_string()),
    }
}

pub fn key(id: &str) -> ApiKey {
    ApiKey::new(id, format!("AIzaSy-{id}-0123456789"))
}

pub fn server(id: &str) -> WorkerServer {
    let mut server = WorkerServer::new(id, format!("http://{id}.local:8080"));
    server.name = id.to_string();
    server
}

/// 由内存存储和测试替身组装的完整引擎
pub struct Engine {
    pub distributor: Arc<JobDistributor>,
    pub aggregator: Arc<ResultAggregator>,
    pub registry: Arc<CancellationRegistry>,
    pub refunds: Arc<RefundBook>,
    pub jobs: Arc<InMemoryJobRepository>,
    pub tasks: Arc<InMemoryTaskRepository>,
    pub servers: Arc<InMemoryWorkerServerRepository>,
    pub keys: Arc<InMemoryResourceStore<ApiKey>>,
    pub proxies: Arc<InMemoryResourceStore<Proxy>>,
    pub quota: Arc<InMemoryQuotaLedger>,
    pub key_pool: Arc<ResourcePool<ApiKey>>,
    pub proxy_pool: Arc<ResourcePool<Proxy>>,
    pub key_cooldown: Arc<CooldownManager<ApiKey>>,
    pub proxy_health: Arc<ProxyHealth>,
    pub sender: Arc<FakeSender>,
    pub notifier: Arc<RecordingNotifier>,
}

pub struct EngineBuilder {
    pub config: DistributionConfig,
    pub servers: Vec<WorkerServer>,
    pub keys: Vec<ApiKey>,
    pub proxies: Vec<Proxy>,
    pub sender: FakeSender,
    pub daily_line_limit: u32,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: DistributionConfig {
                lines_per_server: 10,
                merge_batch_threshold: 0,
                api_keys_per_server: 1,
                ..DistributionConfig::default()
            },
            servers: vec![server("w1"), server("w2")],
            keys: vec![key("k1"), key("k2"), key("k3")],
            proxies: Vec::new(),
            sender: FakeSender::default(),
            daily_line_limit: 10_000,
        }
    }
}

impl EngineBuilder {
    pub async fn build(self) -> Engine {
        let clock = DailyClock::utc();
        let jobs = Arc::new(InMemoryJobRepository::new());
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let servers = Arc::new(InMemoryWorkerServerRepository::with_servers(self.servers).await);
        let keys = Arc::new(InMemoryResourceStore::with_resources(self.keys).await);
        let proxies = Arc::new(InMemoryResourceStore::with_resources(self.proxies).await);
        let quota = Arc::new(InMemoryQuotaLedger::new(self.daily_line_limit, clock));

        let key_pool = Arc::new(ResourcePool::new(
            keys.clone(),
            clock,
            ResourcePoolConfig {
                name: "api_key".to_string(),
                ..ResourcePoolConfig::default()
            },
        ));
        let proxy_pool = Arc::new(ResourcePool::new(
            proxies.clone(),
            clock,
            ResourcePoolConfig {
                name: "proxy".to_string(),
                ..ResourcePoolConfig::default()
            },
        ));
        let key_cooldown = Arc::new(CooldownManager::new("api_key", keys.clone()));
        let proxy_health = Arc::new(ProxyHealth::new(proxies.clone(), Some(ProxyConfig::default())));

        let refunds = Arc::new(RefundBook::new(jobs.clone(), quota.clone()));
        let registry = Arc::new(CancellationRegistry::new(jobs.clone(), refunds.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let aggregator = Arc::new(ResultAggregator::new(
            jobs.clone(),
            tasks.clone(),
            key_pool.clone(),
            key_cooldown.clone(),
            refunds.clone(),
            registry.clone(),
            Some(notifier.clone()),
        ));
        let sender = Arc::new(self.sender);
        let distributor = Arc::new(JobDistributor::new(
            self.config,
            Some("http://main/api/subtitle/callback".to_string()),
            DispatchStores {
                jobs: jobs.clone(),
                tasks: tasks.clone(),
                servers: servers.clone(),
                quota: quota.clone(),
            },
            key_pool.clone(),
            refunds.clone(),
            registry.clone(),
            aggregator.clone(),
            sender.clone(),
        ));

        Engine {
            distributor,
            aggregator,
            registry,
            refunds,
            jobs,
            tasks,
            servers,
            keys,
            proxies,
            quota,
            key_pool,
            proxy_pool,
            key_cooldown,
            proxy_health,
            sender,
            notifier,
        }
    }
}

impl Engine {
    pub async fn job(&self, session_id: &str) -> Job {
        self.jobs.get(session_id).await.unwrap().unwrap()
    }

    /// 轮询直到条件满足，最多等待2秒
    pub async fn wait_for<F>(&self, session_id: &str, condition: F) -> Job
    where
        F: Fn(&Job, &[subtitle_domain::ServerTask]) -> bool,
    {
        use subtitle_domain::TaskRepository;
        for _ in 0..200 {
            let job = self.job(session_id).await;
            let tasks = self.tasks.list_for_job(session_id).await.unwrap();
            if condition(&job, &tasks) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待任务 {session_id} 达到预期状态超时");
    }
}
