// Result reporting to the grading backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use stagerun_common::redis;
use stagerun_common::types::{JobResult, ReportedResult};

/// Consumer of terminal job results. Failures are the caller's to log.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report(&self, commit_sha: &str, result: &JobResult) -> Result<()>;
}

/// Publishes results onto a Redis list read by the grading backend
pub struct RedisResultReporter {
    conn: ConnectionManager,
    queue: String,
}

impl RedisResultReporter {
    pub fn new(conn: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            conn,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl ResultReporter for RedisResultReporter {
    async fn report(&self, commit_sha: &str, result: &JobResult) -> Result<()> {
        let reported = ReportedResult {
            commit_sha: commit_sha.to_string(),
            result: result.clone(),
        };

        let mut conn = self.conn.clone();
        redis::push_result(&mut conn, &self.queue, &reported)
            .await
            .with_context(|| format!("Failed to publish result to {}", self.queue))
    }
}
