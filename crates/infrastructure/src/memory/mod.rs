//! 内存存储实现
//!
//! 核心只依赖仓储抽象，这里提供进程内实现，测试和单机部署都使用它们。

pub mod job_store;
pub mod quota;
pub mod resource_store;
pub mod server_store;
pub mod task_store;

pub use job_store::InMemoryJobRepository;
pub use quota::InMemoryQuotaLedger;
pub use resource_store::InMemoryResourceStore;
pub use server_store::InMemoryWorkerServerRepository;
pub use task_store::InMemoryTaskRepository;
