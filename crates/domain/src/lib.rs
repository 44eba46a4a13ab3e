pub mod models;
pub mod ports;
pub mod repositories;

pub use models::*;
pub use ports::*;
pub use repositories::*;
pub use subtitle_core::{DispatchError, DispatchResult};
