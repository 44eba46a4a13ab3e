pub mod callback;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod resources;
pub mod translate;
