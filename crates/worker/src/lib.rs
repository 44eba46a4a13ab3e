//! 出站HTTP通信
//!
//! - [`HttpBatchSender`] 把批次发送给远程翻译Worker
//! - [`HttpJobNotifier`] 任务结束时通知客户端回调地址
//! - [`GeminiClient`] 单进程路径直接调用上游模型，可经由代理

pub mod components;

pub use components::{GeminiClient, GeminiSettings, HttpBatchSender, HttpJobNotifier};
