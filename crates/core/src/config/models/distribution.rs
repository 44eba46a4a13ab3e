use serde::{Deserialize, Serialize};

/// 分布式分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// 每个Worker服务器一次接收的行数（批次大小）
    pub lines_per_server: u32,
    /// Worker内部每次调用模型的行数
    pub batch_size_per_server: u32,
    /// 每个批次分配的API密钥数量
    pub api_keys_per_server: u32,
    /// 尾部小批次合并阈值
    pub merge_batch_threshold: u32,
    /// 发送到Worker的HTTP超时（秒）
    pub server_timeout_seconds: u64,
    /// 失败批次的最大重发次数
    pub max_server_retries: u32,
    /// 同一Worker连续批次之间的延迟（毫秒）
    pub delay_between_server_batches_ms: u64,
    /// Worker内部批次之间的延迟（毫秒）
    pub worker_delay_between_batches_ms: u64,
    /// 是否要求Worker回调
    pub enable_callback: bool,
    pub default_model: String,
    pub thinking_budget: Option<u32>,
    /// 单个任务的整体超时（分钟）
    pub job_timeout_minutes: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            lines_per_server: 100,
            batch_size_per_server: 30,
            api_keys_per_server: 5,
            merge_batch_threshold: 10,
            server_timeout_seconds: 300,
            max_server_retries: 3,
            delay_between_server_batches_ms: 0,
            worker_delay_between_batches_ms: 500,
            enable_callback: true,
            default_model: "gemini-2.5-flash".to_string(),
            thinking_budget: None,
            job_timeout_minutes: 15,
        }
    }
}

impl DistributionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        check_range("lines_per_server", self.lines_per_server as u64, 10, 500)?;
        check_range("batch_size_per_server", self.batch_size_per_server as u64, 5, 100)?;
        check_range("api_keys_per_server", self.api_keys_per_server as u64, 1, 20)?;
        check_range("merge_batch_threshold", self.merge_batch_threshold as u64, 1, 50)?;
        check_range("server_timeout_seconds", self.server_timeout_seconds, 30, 600)?;
        check_range("max_server_retries", self.max_server_retries as u64, 1, 10)?;
        check_range(
            "delay_between_server_batches_ms",
            self.delay_between_server_batches_ms,
            0,
            10_000,
        )?;

        if self.default_model.trim().is_empty() {
            return Err(anyhow::anyhow!("默认模型不能为空"));
        }

        if self.job_timeout_minutes == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        Ok(())
    }
}

/// 资源池速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 速率窗口（秒）
    pub window_seconds: u64,
    pub default_key_rpm: u32,
    pub default_proxy_rpm: u32,
    /// 未单独配置时API密钥的每日请求上限
    pub default_key_daily_limit: Option<u32>,
    /// 等待超过该值的获取会被记录（毫秒）
    pub slow_acquire_log_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            default_key_rpm: 10,
            default_proxy_rpm: 10,
            default_key_daily_limit: None,
            slow_acquire_log_ms: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_seconds == 0 {
            return Err(anyhow::anyhow!("速率窗口必须大于0"));
        }
        if self.default_key_rpm == 0 || self.default_proxy_rpm == 0 {
            return Err(anyhow::anyhow!("默认RPM必须大于0"));
        }
        Ok(())
    }
}

/// 单进程翻译路径配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 每次上游调用的行数
    pub batch_size: u32,
    pub upstream_base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            batch_size: 50,
            upstream_base_url: "https://generativelanguage.googleapis.com".to_string(),
            request_timeout_seconds: 180,
        }
    }
}

impl TranslationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow::anyhow!("最大重试次数必须大于0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("翻译批次大小必须大于0"));
        }
        Ok(())
    }
}

/// 代理健康配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub failure_threshold: u32,
    pub intermittent_failure_threshold: u32,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_reason_length: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            intermittent_failure_threshold: 10,
            connect_timeout_seconds: 10,
            request_timeout_seconds: 180,
            max_reason_length: 500,
        }
    }
}

/// 用户每日行数配额
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_line_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_line_limit: 10_000,
        }
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> anyhow::Result<()> {
    if value < min || value > max {
        return Err(anyhow::anyhow!(
            "{name} 超出允许范围 [{min}, {max}]: {value}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_distribution_is_valid() {
        assert!(DistributionConfig::default().validate().is_ok());
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(TranslationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let config = DistributionConfig {
            lines_per_server: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("lines_per_server"));

        let config = DistributionConfig {
            api_keys_per_server: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DistributionConfig {
            delay_between_server_batches_ms: 10_001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
