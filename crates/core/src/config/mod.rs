//! 配置管理
//!
//! 配置按职责拆分为多个段落（API、分发、速率限制、单进程翻译、代理、配额、维护、可观测性、资源种子），
//! 每个段落都有默认值和 `validate()`。加载顺序为默认值、TOML文件、`SUBTITLE__` 前缀的环境变量。

pub mod models;

pub use models::*;
