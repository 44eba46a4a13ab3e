use std::time::Duration;

use async_trait::async_trait;
use subtitle_core::{DispatchError, DispatchResult, DistributionConfig};
use subtitle_domain::{BatchSender, CallbackPayload, CallbackStatus, TranslateRequest, WorkerServer};
use tracing::{debug, warn};

/// 通过HTTP把批次发送给Worker的 `/translate` 接口
pub struct HttpBatchSender {
    http_client: reqwest::Client,
}

impl HttpBatchSender {
    pub fn new(timeout: Duration) -> DispatchResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http_client })
    }

    pub fn from_config(config: &DistributionConfig) -> DispatchResult<Self> {
        Self::new(Duration::from_secs(config.server_timeout_seconds))
    }
}

/// 请求没有得到HTTP响应时的错误分类
pub(crate) fn map_send_error(error: reqwest::Error, target: &str) -> DispatchError {
    if error.is_timeout() {
        DispatchError::Timeout(format!("{target} 请求超时: {error}"))
    } else {
        DispatchError::TransportFailure(format!("{target} 连接失败: {error}"))
    }
}

/// 响应体中的终态结果，接受确认等其他内容返回None
fn terminal_payload(body: &str) -> Option<CallbackPayload> {
    let payload: CallbackPayload = serde_json::from_str(body).ok()?;
    match payload.parsed_status() {
        Ok(CallbackStatus::Completed | CallbackStatus::Failed) => Some(payload),
        _ => None,
    }
}

#[async_trait]
impl BatchSender for HttpBatchSender {
    async fn send_batch(
        &self,
        server: &WorkerServer,
        request: &TranslateRequest,
    ) -> DispatchResult<Option<CallbackPayload>> {
        let url = server.translate_url();
        debug!("POST {} ({})", url, request.session_id);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| map_send_error(e, &server.name))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("Worker {} 返回 HTTP {}: {}", server.name, status, body);
            return Err(DispatchError::UpstreamFailure {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(terminal_payload(&body))
    }
}
