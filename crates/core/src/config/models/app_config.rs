use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    distribution::{DistributionConfig, ProxyConfig, QuotaConfig, RateLimitConfig, TranslationConfig},
    resources::ResourceSeedConfig,
    service::{ApiConfig, MaintenanceConfig, ObservabilityConfig},
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub distribution: DistributionConfig,
    pub rate_limit: RateLimitConfig,
    pub translation: TranslationConfig,
    pub proxy: ProxyConfig,
    pub quota: QuotaConfig,
    pub maintenance: MaintenanceConfig,
    pub observability: ObservabilityConfig,
    pub resources: ResourceSeedConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 结构体默认值
    /// 2. 配置文件 (TOML)
    /// 3. 环境变量覆盖 (前缀 `SUBTITLE__`，层级分隔符 `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/subtitle.toml", "subtitle.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SUBTITLE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.api.validate().context("API配置验证失败")?;
        self.distribution.validate().context("分发配置验证失败")?;
        self.rate_limit.validate().context("速率限制配置验证失败")?;
        self.translation.validate().context("翻译配置验证失败")?;
        self.maintenance.validate().context("维护任务配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        self.resources.validate().context("资源种子配置验证失败")?;
        Ok(())
    }
}
