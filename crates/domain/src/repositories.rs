//! 领域仓储抽象
//!
//! 存储只需要提供按记录的原子更新：修改通过闭包在单条记录的锁内完成，
//! 不同记录之间不共享全局锁。

use async_trait::async_trait;
use subtitle_core::DispatchResult;

use crate::models::{Job, PooledResource, ResourceState, ServerTask, WorkerServer};

/// 任务修改闭包，返回值表示是否发生了变更
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> bool + Send>;
/// 批次修改闭包，返回值表示是否发生了变更
pub type TaskMutation = Box<dyn FnOnce(&mut ServerTask) -> bool + Send>;
pub type ServerMutation = Box<dyn FnOnce(&mut WorkerServer) + Send>;
pub type StateMutation = Box<dyn FnOnce(&mut ResourceState) + Send>;

/// 翻译任务仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 插入新任务，会话ID重复时返回 `DuplicateSession`
    async fn insert(&self, job: Job) -> DispatchResult<()>;
    async fn get(&self, session_id: &str) -> DispatchResult<Option<Job>>;
    /// 原子修改，返回修改后的记录以及闭包是否报告了变更
    async fn modify(&self, session_id: &str, mutation: JobMutation) -> DispatchResult<(Job, bool)>;
    async fn list_by_owner(&self, owner_id: &str) -> DispatchResult<Vec<Job>>;
}

/// 批次任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: ServerTask) -> DispatchResult<()>;
    async fn get(&self, session_id: &str, batch_index: u32) -> DispatchResult<Option<ServerTask>>;
    /// 按批次序号排序
    async fn list_for_job(&self, session_id: &str) -> DispatchResult<Vec<ServerTask>>;
    async fn modify(
        &self,
        session_id: &str,
        batch_index: u32,
        mutation: TaskMutation,
    ) -> DispatchResult<(ServerTask, bool)>;
}

/// Worker服务器仓储
#[async_trait]
pub trait WorkerServerRepository: Send + Sync {
    async fn list(&self) -> DispatchResult<Vec<WorkerServer>>;
    async fn get(&self, id: &str) -> DispatchResult<Option<WorkerServer>>;
    async fn upsert(&self, server: WorkerServer) -> DispatchResult<()>;
    async fn modify(&self, id: &str, mutation: ServerMutation) -> DispatchResult<WorkerServer>;
}

/// 受速率限制资源的存储（API密钥、代理）
#[async_trait]
pub trait ResourceStore<R: PooledResource>: Send + Sync {
    async fn list(&self) -> DispatchResult<Vec<R>>;
    async fn get(&self, id: &str) -> DispatchResult<Option<R>>;
    async fn upsert(&self, resource: R) -> DispatchResult<()>;
    async fn remove(&self, id: &str) -> DispatchResult<bool>;
    /// 在单个资源的锁内修改其状态，返回修改后的状态
    async fn update_state(&self, id: &str, mutation: StateMutation) -> DispatchResult<ResourceState>;
}

/// 用户每日行数配额
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// 扣除配额，返回实际授予的行数（可能少于请求数）
    async fn charge(&self, owner_id: &str, lines: u32) -> DispatchResult<u32>;
    async fn refund(&self, owner_id: &str, lines: u32) -> DispatchResult<()>;
    async fn remaining(&self, owner_id: &str) -> DispatchResult<u32>;
}
