pub mod types;
pub mod redis;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{JobRequest, JobResult, Language, LogMessage, ProgressRecord, ProgressStatus};
pub use config::Config;
