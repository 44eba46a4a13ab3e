//! 字幕翻译分发引擎
//!
//! 资源池与冷却管理负责密钥和代理的速率、配额与健康状态；
//! 分发器切分批次并发送给Worker，结果汇总器在所有批次结束后给出任务终态。

pub mod aggregator;
pub mod batch_planner;
pub mod cancellation;
pub mod cooldown;
pub mod distributor;
pub mod maintenance;
pub mod proxy_health;
pub mod refund;
pub mod resource_pool;
pub mod translation;

pub use aggregator::ResultAggregator;
pub use batch_planner::{plan, BatchSpan};
pub use cancellation::CancellationRegistry;
pub use cooldown::{cooldown_duration, CooldownEntry, CooldownManager, MAX_COOLDOWN};
pub use distributor::{DispatchStores, JobDistributor};
pub use maintenance::{MaintenanceReport, MaintenanceSettings, ResourceMaintenance};
pub use proxy_health::{ProxyFailureKind, ProxyHealth};
pub use refund::RefundBook;
pub use resource_pool::{PoolStatus, ResourcePool, ResourcePoolConfig, Slot};
pub use translation::{DirectTranslator, TranslatorResources, TranslatorSettings};
