//! 与Worker、客户端和上游模型交换的消息格式

use serde::{Deserialize, Serialize};
use subtitle_core::{DispatchError, DispatchResult};

use super::lines::{SubtitleLine, TranslatedLine};

/// 发送给Worker服务器的翻译请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub model: String,
    pub prompt: String,
    pub lines: Vec<SubtitleLine>,
    pub system_instruction: Option<String>,
    /// 复合会话键 `{sessionId}_batch{N}`
    pub session_id: String,
    pub api_keys: Vec<String>,
    pub batch_size: u32,
    pub thinking_budget: Option<u32>,
    pub callback_url: Option<String>,
    pub delay_between_batches_ms: u64,
    pub total_internal_batches: u32,
    pub max_retries: u32,
    pub is_retry: bool,
    pub retry_count: u32,
}

/// Worker上报的单个密钥使用情况
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyUsage {
    pub api_key: String,
    #[serde(default)]
    pub masked_key: String,
    #[serde(default)]
    pub request_count: u32,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

/// Worker回调中的批次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Completed,
    Failed,
    Processing,
}

impl std::str::FromStr for CallbackStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(CallbackStatus::Completed),
            "failed" => Ok(CallbackStatus::Failed),
            "processing" => Ok(CallbackStatus::Processing),
            _ => Err(DispatchError::UnknownStatus(s.to_string())),
        }
    }
}

/// Worker回调载荷，同步响应体也使用相同格式
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub total_lines: u32,
    #[serde(default)]
    pub completed_lines: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub api_key_usage: Vec<ApiKeyUsage>,
    #[serde(default)]
    pub results: Option<Vec<TranslatedLine>>,
}

impl CallbackPayload {
    /// 在边界处把状态字符串转换为封闭枚举
    pub fn parsed_status(&self) -> DispatchResult<CallbackStatus> {
        self.status.parse()
    }

    /// 报告失败的密钥
    pub fn failed_keys(&self) -> impl Iterator<Item = &ApiKeyUsage> {
        self.api_key_usage.iter().filter(|u| u.failure_count > 0)
    }
}

/// 任务终态时发送给客户端回调地址的通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientNotification {
    pub session_id: String,
    pub status: String,
    pub total_lines: u32,
    pub completed_lines: u32,
    pub progress: f64,
    pub error: Option<String>,
}

/// 单进程路径中对上游模型的一次调用
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub lines: Vec<SubtitleLine>,
    pub thinking_budget: Option<u32>,
}

impl UpstreamRequest {
    /// 以 `index: text` 的形式拼接行，模型按相同格式返回
    pub fn render_lines(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{}: {}", l.index, l.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
