pub mod app_config;
pub mod distribution;
pub mod resources;
pub mod service;

pub use app_config::AppConfig;
pub use distribution::{DistributionConfig, ProxyConfig, QuotaConfig, RateLimitConfig, TranslationConfig};
pub use resources::{ApiKeySeed, ResourceSeedConfig, WorkerServerSeed};
pub use service::{ApiConfig, MaintenanceConfig, ObservabilityConfig};
