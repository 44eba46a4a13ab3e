#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use subtitle_api::{create_app, AppState};
use subtitle_core::{DailyClock, DispatchResult, DistributionConfig, ProxyConfig};
use subtitle_dispatcher::{
    CancellationRegistry, CooldownManager, DirectTranslator, DispatchStores, JobDistributor,
    ProxyHealth, RefundBook, ResourcePool, ResourcePoolConfig, ResultAggregator,
    TranslatorResources, TranslatorSettings,
};
use subtitle_domain::{
    ApiKey, BatchSender, CallbackPayload, JobRepository, JobStatus, Proxy, TranslateRequest,
    UpstreamModel, UpstreamRequest, WorkerServer,
};
use subtitle_infrastructure::{
    InMemoryJobRepository, InMemoryQuotaLedger, InMemoryResourceStore, InMemoryTaskRepository,
    InMemoryWorkerServerRepository,
};
use tower::ServiceExt;

/// 接受所有批次，结果由测试通过回调接口送回
#[derive(Default)]
pub struct AcceptingSender {
    pub sent: Mutex<Vec<TranslateRequest>>,
}

#[async_trait]
impl BatchSender for AcceptingSender {
    async fn send_batch(
        &self,
        _server: &WorkerServer,
        request: &TranslateRequest,
    ) -> DispatchResult<Option<CallbackPayload>> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(None)
    }
}

/// 把每一行原样加前缀返回
pub struct EchoModel;

#[async_trait]
impl UpstreamModel for EchoModel {
    async fn generate(
        &self,
        request: &UpstreamRequest,
        _api_key: &ApiKey,
        _proxy: Option<&Proxy>,
    ) -> DispatchResult<String> {
        Ok(request
            .lines
            .iter()
            .map(|l| format!("{}: 译:{}", l.index, l.text))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct TestApp {
    pub router: Router,
    pub sender: Arc<AcceptingSender>,
    pub jobs: Arc<InMemoryJobRepository>,
}

pub async fn test_app(with_servers: bool) -> TestApp {
    let clock = DailyClock::utc();
    let servers = if with_servers {
        vec![WorkerServer::new("w1", "http://w1:8000")]
    } else {
        Vec::new()
    };
    let jobs = Arc::new(InMemoryJobRepository::new());
    let tasks = Arc::new(InMemoryTaskRepository::new());
    let servers = Arc::new(InMemoryWorkerServerRepository::with_servers(servers).await);
    let keys = Arc::new(
        InMemoryResourceStore::with_resources(vec![
            ApiKey::new("k1", "AIzaSy-k1-0123456789"),
            ApiKey::new("k2", "AIzaSy-k2-0123456789"),
        ])
        .await,
    );
    let proxies = Arc::new(InMemoryResourceStore::<Proxy>::with_resources(Vec::new()).await);
    let quota = Arc::new(InMemoryQuotaLedger::new(1000, clock));

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
    let aggregator = Arc::new(ResultAggregator::new(
        jobs.clone(),
        tasks.clone(),
        key_pool.clone(),
        key_cooldown.clone(),
        refunds.clone(),
        registry.clone(),
        None,
    ));

    let config = DistributionConfig {
        lines_per_server: 10,
        merge_batch_threshold: 1,
        api_keys_per_server: 1,
        ..DistributionConfig::default()
    };
    let sender = Arc::new(AcceptingSender::default());
    let distributor = Arc::new(JobDistributor::new(
        config,
        Some("http://main/api/subtitle/callback".to_string()),
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
        sender.clone(),
    ));
    let translator = Arc::new(DirectTranslator::new(
        Some(TranslatorSettings {
            retry_delay: Duration::from_millis(10),
            acquire_timeout: Duration::from_secs(1),
            ..TranslatorSettings::default()
        }),
        TranslatorResources {
            key_pool: key_pool.clone(),
            proxy_pool,
            key_cooldown: key_cooldown.clone(),
            proxy_health,
        },
        jobs.clone(),
        quota,
        refunds,
        registry,
        Arc::new(EchoModel),
    ));

    let state = AppState {
        distributor,
        translator,
        jobs: jobs.clone(),
        key_pool,
        key_cooldown,
        metrics_handle: None,
    };
    TestApp {
        router: create_app(state, true),
        sender,
        jobs,
    }
}

impl TestApp {
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    /// 等待后台分发把任务的所有批次发出并结束分发阶段
    pub async fn wait_for_sent(&self, session_id: &str, count: usize) -> Vec<TranslateRequest> {
        for _ in 0..200 {
            let sent = self.sender.sent.lock().unwrap().clone();
            let dispatched = self
                .jobs
                .get(session_id)
                .await
                .unwrap()
                .is_some_and(|job| job.status != JobStatus::Distributing);
            if sent.len() >= count && dispatched {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("批次没有全部发出");
    }
}

pub fn get(uri: &str, owner: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("x-user-id", owner);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn post(uri: &str, owner: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(owner) = owner {
        builder = builder.header("x-user-id", owner);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn submit_body(session_id: &str, count: u32) -> Value {
    let lines: Vec<Value> = (1..=count)
        .map(|i| json!({"index": i, "text": format!("line {i}")}))
        .collect();
    json!({
        "sessionId": session_id,
        "lines": lines,
        "prompt": "翻译成中文",
    })
}

pub fn completed_callback(request: &TranslateRequest) -> Value {
    let results: Vec<Value> = request
        .lines
        .iter()
        .map(|l| json!({"index": l.index, "original": l.text, "translated": format!("译:{}", l.text)}))
        .collect();
    json!({
        "sessionId": request.session_id,
        "status": "completed",
        "totalLines": request.lines.len(),
        "completedLines": request.lines.len(),
        "apiKeyUsage": [],
        "results": results,
    })
}
