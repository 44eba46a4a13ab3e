use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    /// 对外可访问的主服务地址，用于拼接Worker回调URL
    pub main_server_url: String,
    pub cors_enabled: bool,
    pub request_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            main_server_url: "http://localhost:8080".to_string(),
            cors_enabled: true,
            request_timeout_seconds: 30,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("绑定地址不能为空"));
        }
        if !self.bind_address.contains(':') {
            return Err(anyhow::anyhow!("绑定地址格式无效: {}", self.bind_address));
        }
        if !self.main_server_url.starts_with("http://")
            && !self.main_server_url.starts_with("https://")
        {
            return Err(anyhow::anyhow!(
                "主服务地址必须以 http:// 或 https:// 开头: {}",
                self.main_server_url
            ));
        }
        Ok(())
    }

    /// Worker回调地址
    pub fn callback_url(&self) -> String {
        format!(
            "{}/api/subtitle/callback",
            self.main_server_url.trim_end_matches('/')
        )
    }
}

/// 后台维护任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
    /// 每日重置使用的固定UTC偏移（小时）
    pub timezone_offset_hours: i32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            timezone_offset_hours: 7,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("维护间隔必须大于0"));
        }
        if !(-12..=14).contains(&self.timezone_offset_hours) {
            return Err(anyhow::anyhow!(
                "时区偏移超出范围: {}",
                self.timezone_offset_hours
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}
