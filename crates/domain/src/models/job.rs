use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lines::{SubtitleLine, TranslatedLine};

/// 任务取消时写入的错误信息
pub const CANCELLED_BY_USER: &str = "任务已被用户取消";
/// 看门狗超时写入的错误信息
pub const JOB_TIMED_OUT: &str = "任务执行超时";

/// 翻译任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Distributing,
    Processing,
    Completed,
    PartialCompleted,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PartialCompleted | JobStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// 客户端回调使用的小写形式
    pub fn as_lowercase(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Distributing => "distributing",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::PartialCompleted => "partialcompleted",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 一次字幕翻译任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub session_id: String,
    pub owner_id: String,
    pub status: JobStatus,
    pub model: String,
    pub instruction: String,
    pub system_instruction: Option<String>,
    pub lines: Vec<SubtitleLine>,
    pub total_lines: u32,
    pub completed_lines: u32,
    pub progress: f64,
    pub batch_count: u32,
    pub callback_url: Option<String>,
    pub results: Vec<TranslatedLine>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// 退款只能发生一次
    pub has_refunded: bool,
    pub refunded_lines: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        lines: Vec<SubtitleLine>,
        instruction: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let total_lines = lines.len() as u32;
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            status: JobStatus::Pending,
            model: model.into(),
            instruction: instruction.into(),
            system_instruction: None,
            lines,
            total_lines,
            completed_lines: 0,
            progress: 0.0,
            batch_count: 0,
            callback_url: None,
            results: Vec::new(),
            error_message: None,
            error_details: None,
            has_refunded: false,
            refunded_lines: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: Option<String>) -> Self {
        self.system_instruction = instruction;
        self
    }

    pub fn with_callback_url(mut self, url: Option<String>) -> Self {
        self.callback_url = url;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_details
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(|r| r.as_str())
            == Some("USER_CANCELLED")
    }

    /// 更新已完成行数和进度
    pub fn update_progress(&mut self, completed_lines: u32) {
        self.completed_lines = completed_lines.min(self.total_lines);
        self.progress = if self.total_lines == 0 {
            0.0
        } else {
            self.completed_lines as f64 / self.total_lines as f64 * 100.0
        };
    }

    /// 进入终态，已是终态时返回false
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if error.is_some() {
            self.error_message = error;
        }
        self.completed_at = Some(Utc::now());
        true
    }

    /// 未成功完成的行数
    pub fn unfinished_lines(&self) -> u32 {
        self.total_lines.saturating_sub(self.completed_lines)
    }

    /// 标记已退款，已退款时返回false
    pub fn mark_refunded(&mut self, lines: u32) -> bool {
        if self.has_refunded {
            return false;
        }
        self.has_refunded = true;
        self.refunded_lines = lines;
        true
    }

    /// 进度保留两位小数
    pub fn rounded_progress(&self) -> f64 {
        (self.progress * 100.0).round() / 100.0
    }
}
