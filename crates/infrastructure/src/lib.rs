pub mod memory;
pub mod observability;

pub use memory::*;
pub use observability::*;
