//! 领域模型
//!
//! - [`Job`] 一次字幕翻译任务，归提交者所有
//! - [`ServerTask`] 任务中分配给单个Worker的连续批次
//! - [`WorkerServer`] 远程翻译Worker
//! - [`ApiKey`] / [`Proxy`] 受速率限制的共享资源，状态在 [`ResourceState`] 中
//! - `wire` 与Worker、客户端和上游模型交换的载荷
//! - `views` 对外接口的输入输出

pub mod job;
pub mod lines;
pub mod resource;
pub mod server_task;
pub mod views;
pub mod wire;
pub mod worker_server;

pub use job::*;
pub use lines::*;
pub use resource::*;
pub use server_task::*;
pub use views::*;
pub use wire::*;
pub use worker_server::*;
