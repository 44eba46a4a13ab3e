use serde::{Deserialize, Serialize};

/// 启动时载入的资源种子
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSeedConfig {
    pub servers: Vec<WorkerServerSeed>,
    pub api_keys: Vec<ApiKeySeed>,
    /// 代理列表，每行一个，格式 `[scheme://][user:pass@]host:port`
    pub proxies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerServerSeed {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySeed {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ResourceSeedConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(anyhow::anyhow!("Worker服务器ID不能为空"));
            }
            if !server.url.starts_with("http://") && !server.url.starts_with("https://") {
                return Err(anyhow::anyhow!("Worker服务器地址格式无效: {}", server.url));
            }
        }

        let mut ids = std::collections::HashSet::new();
        for key in &self.api_keys {
            if key.key.trim().is_empty() {
                return Err(anyhow::anyhow!("API密钥 {} 不能为空", key.id));
            }
            if !ids.insert(key.id.as_str()) {
                return Err(anyhow::anyhow!("重复的API密钥ID: {}", key.id));
            }
        }

        Ok(())
    }
}
