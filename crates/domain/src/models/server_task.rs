use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtitle_core::{DispatchError, DispatchResult};

use super::lines::TranslatedLine;

/// 复合会话键中批次编号前的分隔符
pub const BATCH_KEY_DELIMITER: &str = "_batch";

/// 批次任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Sent,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Sent => "Sent",
            TaskStatus::Processing => "Processing",
            TaskStatus::Retrying => "Retrying",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }
}

/// 分配给单个Worker的一个批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTask {
    pub session_id: String,
    pub batch_index: u32,
    pub start_index: u32,
    pub line_count: u32,
    pub server_id: Option<String>,
    pub api_key_ids: Vec<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub results: Vec<TranslatedLine>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
}

impl ServerTask {
    pub fn new(session_id: impl Into<String>, batch_index: u32, start_index: u32, line_count: u32) -> Self {
        Self {
            session_id: session_id.into(),
            batch_index,
            start_index,
            line_count,
            server_id: None,
            api_key_ids: Vec::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            error_message: None,
            results: Vec::new(),
            created_at: Utc::now(),
            sent_at: None,
            completed_at: None,
            processing_time_ms: None,
        }
    }

    /// Worker回调使用的复合会话键 `{sessionId}_batch{N}`
    pub fn composite_key(&self) -> String {
        composite_key(&self.session_id, self.batch_index)
    }

    pub fn end_index(&self) -> u32 {
        self.start_index + self.line_count
    }

    /// 更新状态并维护时间戳，终态不可再变更
    pub fn update_status(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        match status {
            TaskStatus::Sent => self.sent_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = status;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.update_status(TaskStatus::Failed) {
            return false;
        }
        self.error_message = Some(error.into());
        true
    }

    pub fn complete(&mut self, results: Vec<TranslatedLine>) -> bool {
        if !self.update_status(TaskStatus::Completed) {
            return false;
        }
        self.results = results;
        self.error_message = None;
        true
    }

    /// 重发前重置为可发送状态
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Retrying;
        self.retry_count += 1;
        self.completed_at = None;
        self.error_message = None;
    }
}

pub fn composite_key(session_id: &str, batch_index: u32) -> String {
    format!("{session_id}{BATCH_KEY_DELIMITER}{batch_index}")
}

/// 解析 `{sessionId}_batch{N}`，格式不符时返回错误且不产生副作用
///
/// 批次号只接受 `composite_key` 生成的规范形式：纯ASCII数字，不带符号和前导零。
pub fn parse_composite_key(key: &str) -> DispatchResult<(String, u32)> {
    let malformed = || DispatchError::InvalidCallbackKey(key.to_string());
    let parts: Vec<&str> = key.split(BATCH_KEY_DELIMITER).collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(malformed());
    }
    let digits = parts[1];
    if digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || (digits.len() > 1 && digits.starts_with('0'))
    {
        return Err(malformed());
    }
    let batch_index = digits.parse::<u32>().map_err(|_| malformed())?;
    Ok((parts[0].to_string(), batch_index))
}
