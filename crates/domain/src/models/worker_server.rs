use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 远程翻译Worker服务器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerServer {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub is_busy: bool,
    pub current_session_id: Option<String>,
    /// 数值越大越优先
    pub priority: i32,
    pub failure_count: u32,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

impl WorkerServer {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            enabled: true,
            is_busy: false,
            current_session_id: None,
            priority: 0,
            failure_count: 0,
            usage_count: 0,
            last_used_at: None,
            last_failed_at: None,
            last_failure_reason: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.enabled && !self.is_busy
    }

    /// 翻译接口地址
    pub fn translate_url(&self) -> String {
        format!("{}/translate", self.url.trim_end_matches('/'))
    }

    pub fn mark_busy(&mut self, session_id: &str) {
        self.is_busy = true;
        self.current_session_id = Some(session_id.to_string());
    }

    /// 发送结束后释放，无论成功与否
    pub fn mark_idle(&mut self, success: bool) {
        self.is_busy = false;
        self.current_session_id = None;
        self.last_used_at = Some(Utc::now());
        if success {
            self.usage_count += 1;
        }
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.failure_count += 1;
        self.last_failed_at = Some(Utc::now());
        self.last_failure_reason = Some(reason.into());
    }
}
