pub mod clock;
pub mod config;
pub mod errors;

pub use clock::DailyClock;
pub use config::*;
pub use errors::{DispatchError, Result};

/// 统一的Result类型别名
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
