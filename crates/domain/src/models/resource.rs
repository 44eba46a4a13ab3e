//! 受速率限制的共享资源：API密钥和出口代理
//!
//! 两类资源共用 [`ResourceState`]，资源池与冷却管理只通过 [`PooledResource`] 访问它们。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 冷却原因前缀，冷却到期时只清除带此前缀的原因
pub const COOLDOWN_MARKER: &str = "[COOLDOWN";
/// 永久禁用原因前缀
pub const PERMANENT_MARKER: &str = "[PERMANENT]";
/// 每日上限禁用原因前缀，每日重置时会重新启用
pub const DAILY_LIMIT_MARKER: &str = "[DAILY_LIMIT]";

/// 资源的可变状态
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub requests_today: u32,
    pub last_reset: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_success: u64,
    pub total_failures: u64,
}

impl ResourceState {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn under_daily_limit(&self, daily_limit: Option<u32>) -> bool {
        daily_limit.map_or(true, |limit| self.requests_today < limit)
    }

    /// 启用、未冷却且未达每日上限
    pub fn is_selectable(&self, now: DateTime<Utc>, daily_limit: Option<u32>) -> bool {
        self.enabled && !self.in_cooldown(now) && self.under_daily_limit(daily_limit)
    }

    pub fn is_permanently_disabled(&self) -> bool {
        !self.enabled
            && self
                .disabled_reason
                .as_deref()
                .is_some_and(|r| r.starts_with(PERMANENT_MARKER))
    }

    pub fn is_daily_limited(&self) -> bool {
        !self.enabled
            && self
                .disabled_reason
                .as_deref()
                .is_some_and(|r| r.starts_with(DAILY_LIMIT_MARKER))
    }
}

/// 资源池中可被选取的资源
pub trait PooledResource: Clone + Send + Sync + 'static {
    fn resource_id(&self) -> &str;
    fn state(&self) -> &ResourceState;
    fn state_mut(&mut self) -> &mut ResourceState;
    /// 每分钟请求上限，None表示使用全局默认值
    fn rpm_limit(&self) -> Option<u32>;
    fn daily_limit(&self) -> Option<u32>;
    /// 日志中使用的脱敏标识
    fn display_name(&self) -> String;
}

/// 模型API密钥
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub rpm_limit: Option<u32>,
    pub daily_limit: Option<u32>,
    pub state: ResourceState,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            rpm_limit: None,
            daily_limit: None,
            state: ResourceState::enabled(),
        }
    }

    pub fn masked_key(&self) -> String {
        mask_key(&self.key)
    }
}

impl PooledResource for ApiKey {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &ResourceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    fn rpm_limit(&self) -> Option<u32> {
        self.rpm_limit
    }

    fn daily_limit(&self) -> Option<u32> {
        self.daily_limit
    }

    fn display_name(&self) -> String {
        self.masked_key()
    }
}

/// 密钥脱敏：前8位 + `****` + 后4位
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks4" => Some(ProxyScheme::Socks4),
            "socks5" | "socks5h" | "socks" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// 出口代理
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub rpm_limit: Option<u32>,
    pub state: ResourceState,
}

impl Proxy {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{host}:{port}"),
            scheme,
            host,
            port,
            username: None,
            password: None,
            rpm_limit: None,
            state: ResourceState::enabled(),
        }
    }

    /// 完整代理URL（含凭据）
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme.as_str(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }

    /// 解析 `[scheme://][user:pass@]host:port`，默认socks5
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (scheme, rest) = match line.split_once("://") {
            Some((scheme, rest)) => (ProxyScheme::parse(scheme)?, rest),
            None => (ProxyScheme::Socks5, line),
        };

        let (credentials, address) = match rest.rsplit_once('@') {
            Some((creds, address)) => (Some(creds), address),
            None => (None, rest),
        };

        let (host, port) = address.trim_end_matches('/').rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse::<u16>().ok().filter(|p| *p > 0)?;

        let mut proxy = Proxy::new(scheme, host, port);
        if let Some(creds) = credentials {
            let (user, pass) = creds.split_once(':')?;
            proxy.username = Some(user.to_string());
            proxy.password = Some(pass.to_string());
        }
        Some(proxy)
    }
}

impl PooledResource for Proxy {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &ResourceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    fn rpm_limit(&self) -> Option<u32> {
        self.rpm_limit
    }

    fn daily_limit(&self) -> Option<u32> {
        None
    }

    fn display_name(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// 解析代理列表，每行一个；注释和空行忽略，无效行记录警告后跳过
pub fn parse_proxy_list<S: AsRef<str>>(lines: impl IntoIterator<Item = S>) -> Vec<Proxy> {
    let mut proxies: Vec<Proxy> = Vec::new();
    for raw in lines {
        for line in raw.as_ref().lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match Proxy::parse(trimmed) {
                Some(proxy) if proxies.iter().any(|p| p.id == proxy.id) => {
                    warn!("忽略重复代理: {}", proxy.display_name());
                }
                Some(proxy) => proxies.push(proxy),
                None => warn!("无法解析代理配置行: {}", trimmed),
            }
        }
    }
    proxies
}
