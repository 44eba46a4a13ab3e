mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use subtitle_core::DispatchResult;
use subtitle_dispatcher::{DirectTranslator, TranslatorResources, TranslatorSettings};
use subtitle_domain::{
    line_errors, ApiKey, Job, JobRepository, JobStatus, Proxy, ProxyScheme, QuotaLedger, ResourceStore,
    UpstreamModel, UpstreamRequest,
};
use subtitle_infrastructure::InMemoryResourceStore;
use tokio_util::sync::CancellationToken;

fn translator(engine: &Engine, model: Arc<dyn UpstreamModel>) -> DirectTranslator {
    let settings = TranslatorSettings {
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        acquire_timeout: Duration::from_secs(1),
        job_timeout: Duration::from_secs(600),
        ..TranslatorSettings::default()
    };
    DirectTranslator::new(
        Some(settings),
        TranslatorResources {
            key_pool: engine.key_pool.clone(),
            proxy_pool: engine.proxy_pool.clone(),
            key_cooldown: engine.key_cooldown.clone(),
            proxy_health: engine.proxy_health.clone(),
        },
        engine.jobs.clone(),
        engine.quota.clone(),
        engine.refunds.clone(),
        engine.registry.clone(),
        model,
    )
}

fn proxy(host: &str) -> Proxy {
    Proxy::new(ProxyScheme::Socks5, host, 1080)
}

#[tokio::test(start_paused = true)]
async fn test_only_requests_that_reach_upstream_consume_quota() {
    let engine = EngineBuilder {
        keys: vec![key("k1"), key("k2")],
        proxies: vec![proxy("10.0.0.1"), proxy("10.0.0.2")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(ScriptedModel::new(vec![
        ModelReply::Transport("proxy handshake failed".to_string()),
        ModelReply::Upstream(400, "bad request".to_string()),
        ModelReply::Echo,
    ]));

    let job = translator(&engine, model.clone())
        .translate("alice", submit_request("direct-1", 5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.results.len(), 5);
    assert_eq!(job.results[0].translated, "译:line 1");

    let calls = model.calls();
    assert_eq!(calls.len(), 3);
    let failed_proxy = calls[0].1.clone().unwrap();
    // 传输失败后换用另一个代理
    assert!(calls[1..].iter().all(|(_, p)| p.as_deref() != Some(failed_proxy.as_str())));
    // 上游拒绝后换用另一个密钥
    assert_ne!(calls[1].0, calls[2].0);

    let mut requests = 0;
    for id in ["k1", "k2"] {
        requests += engine.keys.get(id).await.unwrap().unwrap().state.requests_today;
    }
    assert_eq!(requests, 2);

    let failed = engine.proxies.get(&failed_proxy).await.unwrap().unwrap();
    assert_eq!(failed.state.consecutive_failures, 1);
    assert!(failed.state.enabled);
    assert_eq!(failed.state.requests_today, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_key_cools_down() {
    let engine = EngineBuilder {
        keys: vec![key("k1"), key("k2")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(ScriptedModel::new(vec![
        ModelReply::Upstream(429, "RESOURCE_EXHAUSTED".to_string()),
        ModelReply::Echo,
    ]));

    let job = translator(&engine, model.clone())
        .translate("alice", submit_request("direct-2", 3))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let calls = model.calls();
    assert!(calls.iter().all(|(_, proxy)| proxy.is_none()));
    let limited = engine.keys.get(&calls[0].0).await.unwrap().unwrap();
    assert!(limited.state.cooldown_until.is_some());
    assert_eq!(limited.state.consecutive_failures, 1);
    assert!(limited
        .state
        .disabled_reason
        .as_deref()
        .unwrap()
        .starts_with("[COOLDOWN 30s]"));
    assert!(engine.key_cooldown.is_in_cooldown(&calls[0].0).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_disable_key() {
    let engine = EngineBuilder {
        keys: vec![key("k1"), key("k2")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(ScriptedModel::new(vec![
        ModelReply::Upstream(403, "API key not valid".to_string()),
        ModelReply::Echo,
    ]));

    let job = translator(&engine, model.clone())
        .translate("alice", submit_request("direct-3", 3))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let rejected = engine.keys.get(&model.calls()[0].0).await.unwrap().unwrap();
    assert!(rejected.state.is_permanently_disabled());
    assert!(rejected.state.cooldown_until.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_fail_lines_and_refund() {
    let engine = EngineBuilder {
        keys: vec![key("k1")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(ScriptedModel::new(vec![ModelReply::Upstream(
        500,
        "internal".to_string(),
    )]));

    let job = translator(&engine, model.clone())
        .translate("alice", submit_request("direct-4", 4))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .results
        .iter()
        .all(|l| l.error_type.as_deref() == Some(line_errors::MAX_RETRIES_EXCEEDED)));
    assert!(job.has_refunded);
    assert_eq!(job.refunded_lines, 4);
    assert_eq!(engine.quota.remaining("alice").await.unwrap(), 10_000);
    // 唯一的密钥被排除后不再重试
    assert_eq!(model.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_is_not_attempted() {
    let engine = EngineBuilder::default().build().await;
    let model = Arc::new(ScriptedModel::default());
    let job = Job::new("direct-5", "alice", lines(3), "翻译", "gemini-2.5-flash");
    engine.jobs.insert(job.clone()).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let results = translator(&engine, model.clone())
        .translate_batch(&job, 0, &job.lines, &token)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|l| l.error_type.as_deref() == Some(line_errors::CANCELLED)));
    assert!(model.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_quota_truncation_applies_to_direct_path() {
    let engine = EngineBuilder {
        daily_line_limit: 2,
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(ScriptedModel::default());

    let job = translator(&engine, model)
        .translate("alice", submit_request("direct-6", 5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_lines, 2);
    assert_eq!(engine.quota.remaining("alice").await.unwrap(), 0);
}

/// 第一次调用时把所用密钥从存储中删除，模拟请求进行中管理员删除密钥
struct KeyRemovingModel {
    keys: Arc<InMemoryResourceStore<ApiKey>>,
    inner: ScriptedModel,
}

#[async_trait]
impl UpstreamModel for KeyRemovingModel {
    async fn generate(
        &self,
        request: &UpstreamRequest,
        api_key: &ApiKey,
        proxy: Option<&Proxy>,
    ) -> DispatchResult<String> {
        if self.inner.calls().is_empty() {
            self.keys.remove(&api_key.id).await.unwrap();
        }
        self.inner.generate(request, api_key, proxy).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_key_removed_during_request_does_not_abort_job() {
    let engine = EngineBuilder {
        keys: vec![key("k1"), key("k2")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(KeyRemovingModel {
        keys: engine.keys.clone(),
        inner: ScriptedModel::new(vec![
            ModelReply::Upstream(429, "RESOURCE_EXHAUSTED".to_string()),
            ModelReply::Echo,
        ]),
    });

    let job = translator(&engine, model.clone())
        .translate("alice", submit_request("direct-7", 5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_lines, 5);
    assert!(job.has_refunded);
    assert_eq!(engine.quota.remaining("alice").await.unwrap(), 10_000 - 5);

    let calls = model.inner.calls();
    assert_eq!(calls.len(), 2);
    assert!(engine.keys.get(&calls[0].0).await.unwrap().is_none());
    assert_ne!(calls[0].0, calls[1].0);
    assert!(engine.registry.active_jobs("alice").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_key_removed_during_request_fails_job_with_refund() {
    let engine = EngineBuilder {
        keys: vec![key("k1")],
        ..EngineBuilder::default()
    }
    .build()
    .await;
    let model = Arc::new(KeyRemovingModel {
        keys: engine.keys.clone(),
        inner: ScriptedModel::new(vec![ModelReply::Upstream(429, "RESOURCE_EXHAUSTED".to_string())]),
    });

    let job = translator(&engine, model)
        .translate("alice", submit_request("direct-8", 4))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.is_terminal());
    assert_eq!(job.refunded_lines, 4);
    assert_eq!(engine.quota.remaining("alice").await.unwrap(), 10_000);
    assert!(engine.registry.active_jobs("alice").await.unwrap().is_empty());
}
