use std::time::Duration;

use async_trait::async_trait;
use subtitle_core::{DispatchError, DispatchResult};
use subtitle_domain::{ClientNotification, JobNotifier};
use tracing::{debug, warn};

use super::worker_client::map_send_error;

/// 任务进入终态后POST到客户端提供的回调地址，失败只记录不重试
pub struct HttpJobNotifier {
    http_client: reqwest::Client,
}

impl HttpJobNotifier {
    pub fn new(timeout: Duration) -> DispatchResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl JobNotifier for HttpJobNotifier {
    async fn notify(&self, callback_url: &str, notification: &ClientNotification) -> DispatchResult<()> {
        let response = self
            .http_client
            .post(callback_url)
            .json(notification)
            .send()
            .await
            .map_err(|e| map_send_error(e, callback_url))?;

        let status = response.status();
        if status.is_success() {
            debug!("已通知 {} 任务 {} 状态 {}", callback_url, notification.session_id, notification.status);
            Ok(())
        } else {
            warn!("客户端回调 {} 返回 HTTP {}", callback_url, status);
            Err(DispatchError::UpstreamFailure {
                status: status.as_u16(),
                message: format!("客户端回调返回 {status}"),
            })
        }
    }
}
