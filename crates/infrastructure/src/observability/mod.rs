//! 可观测性
//!
//! - 日志：`tracing-subscriber`，支持 json / pretty 两种格式
//! - 指标：`metrics` 门面，进程启动时安装 Prometheus 导出器

pub mod dispatch_metrics;
pub mod logging;

pub use dispatch_metrics::{install_prometheus_recorder, DispatchMetrics};
pub use logging::init_logging;
