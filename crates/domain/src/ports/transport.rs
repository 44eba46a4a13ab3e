//! 出站通信端口

use async_trait::async_trait;
use subtitle_core::DispatchResult;

use crate::models::{ApiKey, CallbackPayload, ClientNotification, Proxy, TranslateRequest, UpstreamRequest, WorkerServer};

/// 向远程Worker发送批次
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// 发送成功时，若Worker在响应体中直接返回了终态结果则一并返回
    ///
    /// 连接失败返回 `TransportFailure`，非2xx返回 `UpstreamFailure`
    async fn send_batch(
        &self,
        server: &WorkerServer,
        request: &TranslateRequest,
    ) -> DispatchResult<Option<CallbackPayload>>;
}

/// 任务终态通知
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, callback_url: &str, notification: &ClientNotification) -> DispatchResult<()>;
}

/// 上游翻译模型
#[async_trait]
pub trait UpstreamModel: Send + Sync {
    /// 返回模型输出文本
    ///
    /// 请求未到达上游（代理不可达等）时返回 `TransportFailure`，
    /// 上游返回错误状态时返回 `UpstreamFailure`
    async fn generate(
        &self,
        request: &UpstreamRequest,
        api_key: &ApiKey,
        proxy: Option<&Proxy>,
    ) -> DispatchResult<String>;
}
