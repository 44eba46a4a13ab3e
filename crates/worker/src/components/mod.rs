pub mod gemini_client;
pub mod job_notifier;
pub mod worker_client;

pub use gemini_client::{GeminiClient, GeminiSettings};
pub use job_notifier::HttpJobNotifier;
pub use worker_client::HttpBatchSender;
