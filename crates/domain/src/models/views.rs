use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lines::{SubtitleLine, TranslatedLine};

/// 提交翻译任务的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub session_id: String,
    pub lines: Vec<SubtitleLine>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// 提交结果摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitSummary {
    pub session_id: String,
    pub status: String,
    pub total_lines: u32,
    pub batch_count: u32,
    pub servers_assigned: u32,
    pub message: String,
}

/// 任务状态视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub session_id: String,
    pub status: String,
    pub progress: f64,
    pub total_lines: u32,
    pub completed_lines: u32,
    pub error: Option<String>,
    pub task_stats: BTreeMap<String, u32>,
}

/// 任务结果视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultsView {
    pub session_id: String,
    pub status: String,
    pub total_lines: u32,
    pub completed_lines: u32,
    pub results: Vec<TranslatedLine>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 取消失败的原因代码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelCode {
    NotFound,
    Forbidden,
    AlreadyCompleted,
    AlreadyFailed,
}

impl CancelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCode::NotFound => "NOT_FOUND",
            CancelCode::Forbidden => "FORBIDDEN",
            CancelCode::AlreadyCompleted => "ALREADY_COMPLETED",
            CancelCode::AlreadyFailed => "ALREADY_FAILED",
        }
    }
}

/// 取消操作结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub success: bool,
    pub code: Option<CancelCode>,
    pub message: String,
}

impl CancelOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: None,
            message: message.into(),
        }
    }

    pub fn rejected(code: CancelCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            message: message.into(),
        }
    }
}
