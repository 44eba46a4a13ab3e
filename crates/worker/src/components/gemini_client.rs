//! Gemini `generateContent` 客户端
//!
//! 每个代理使用独立的HTTP客户端并缓存复用。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subtitle_core::{DispatchError, DispatchResult, ProxyConfig, TranslationConfig};
use subtitle_domain::{ApiKey, Proxy, UpstreamModel, UpstreamRequest};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::worker_client::map_send_error;

/// 错误响应体写入错误信息时的最大长度
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl GeminiSettings {
    pub fn from_config(translation: &TranslationConfig, proxy: &ProxyConfig) -> Self {
        Self {
            base_url: translation.upstream_base_url.clone(),
            request_timeout: Duration::from_secs(translation.request_timeout_seconds),
            connect_timeout: Duration::from_secs(proxy.connect_timeout_seconds),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    thinking_config: ThinkingConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

fn build_body(request: &UpstreamRequest) -> GenerateRequest {
    let text = if request.prompt.trim().is_empty() {
        request.render_lines()
    } else {
        format!("{}\n\n{}", request.prompt, request.render_lines())
    };
    GenerateRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part { text }],
        }],
        system_instruction: request.system_instruction.as_ref().map(|s| Content {
            role: None,
            parts: vec![Part { text: s.clone() }],
        }),
        generation_config: request.thinking_budget.map(|budget| GenerationConfig {
            thinking_config: ThinkingConfig {
                thinking_budget: budget,
            },
        }),
    }
}

pub struct GeminiClient {
    settings: GeminiSettings,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> DispatchResult<Self> {
        let direct = Self::build_client(&settings, None)?;
        Ok(Self {
            settings,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn build_client(settings: &GeminiSettings, proxy: Option<&Proxy>) -> DispatchResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.url()).map_err(|e| {
                DispatchError::TransportFailure(format!("invalid proxy {}: {e}", proxy.id))
            })?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| DispatchError::Configuration(format!("创建HTTP客户端失败: {e}")))
    }

    async fn client_for(&self, proxy: Option<&Proxy>) -> DispatchResult<reqwest::Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut cache = self.proxied.lock().await;
        if let Some(client) = cache.get(&proxy.id) {
            return Ok(client.clone());
        }
        let client = Self::build_client(&self.settings, Some(proxy))?;
        cache.insert(proxy.id.clone(), client.clone());
        Ok(client)
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl UpstreamModel for GeminiClient {
    async fn generate(
        &self,
        request: &UpstreamRequest,
        api_key: &ApiKey,
        proxy: Option<&Proxy>,
    ) -> DispatchResult<String> {
        let client = self.client_for(proxy).await?;
        let target = proxy.map_or_else(|| "上游模型".to_string(), |p| format!("代理 {}", p.id));
        debug!("调用 {}（{} 行，密钥 {}）", request.model, request.lines.len(), api_key.masked_key());

        let response = client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", &api_key.key)
            .json(&build_body(request))
            .send()
            .await
            .map_err(|e| map_send_error(e, &target))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            warn!("上游返回 HTTP {}（密钥 {}）: {}", status, api_key.masked_key(), message);
            return Err(DispatchError::UpstreamFailure {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| DispatchError::UpstreamFailure {
            status: status.as_u16(),
            message: format!("无法解析上游响应: {e}"),
        })?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(DispatchError::UpstreamFailure {
                status: status.as_u16(),
                message: "上游响应中没有候选结果".to_string(),
            });
        }
        Ok(text)
    }
}
