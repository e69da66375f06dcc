use crate::types::{JobRequest, ReportedResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};

/// Redis queue semantics
/// Keeps the worker, the CLI and any producer agreeing on key names and
/// payload encoding. Delivery is at-least-once: a claimed job sits in the
/// claiming worker's own processing list until it is acknowledged, so a
/// restarting worker only ever redelivers what it claimed itself.

pub const QUEUE_PREFIX: &str = "stagerun:queue";
pub const PROCESSING_SUFFIX: &str = "processing";

/// Default request queue name
pub fn job_queue() -> String {
    format!("{}:jobs", QUEUE_PREFIX)
}

/// Default result queue name
pub fn result_queue() -> String {
    format!("{}:results", QUEUE_PREFIX)
}

/// Holding list for jobs one worker claimed but has not yet acknowledged
pub fn processing_queue(queue: &str, worker_id: &str) -> String {
    format!("{}:{}:{}", queue, PROCESSING_SUFFIX, worker_id)
}

/// A job payload claimed from the queue.
/// The raw payload is kept verbatim because acknowledgement removes by value.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
}

impl Delivery {
    pub fn parse(&self) -> serde_json::Result<JobRequest> {
        serde_json::from_str(&self.payload)
    }
}

fn encode_err(e: serde_json::Error) -> RedisError {
    RedisError::from((ErrorKind::TypeError, "payload encoding failed", e.to_string()))
}

/// Enqueue a job request
pub async fn push_job(conn: &mut ConnectionManager, queue: &str, job: &JobRequest) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(encode_err)?;
    conn.lpush::<_, _, ()>(queue, payload).await
}

/// Block up to `timeout_secs` for the next job, moving it to the worker's
/// processing list
pub async fn claim_job(
    conn: &mut ConnectionManager,
    queue: &str,
    worker_id: &str,
    timeout_secs: f64,
) -> RedisResult<Option<Delivery>> {
    let payload: Option<String> = redis::cmd("BRPOPLPUSH")
        .arg(queue)
        .arg(processing_queue(queue, worker_id))
        .arg(timeout_secs)
        .query_async(conn)
        .await?;

    Ok(payload.map(|payload| Delivery { payload }))
}

/// Remove a finished delivery from the worker's processing list
pub async fn ack_job(
    conn: &mut ConnectionManager,
    queue: &str,
    worker_id: &str,
    delivery: &Delivery,
) -> RedisResult<()> {
    conn.lrem::<_, _, ()>(processing_queue(queue, worker_id), 1, &delivery.payload)
        .await
}

/// Move every delivery this worker left unacknowledged back onto the
/// request queue. Other workers' processing lists are never touched.
/// Returns how many jobs were redelivered.
pub async fn requeue_stale(conn: &mut ConnectionManager, queue: &str, worker_id: &str) -> RedisResult<usize> {
    let processing = processing_queue(queue, worker_id);
    let mut moved = 0;

    loop {
        let payload: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(&processing)
            .arg(queue)
            .query_async(conn)
            .await?;

        match payload {
            Some(_) => moved += 1,
            None => break,
        }
    }

    if moved > 0 {
        tracing::info!(queue, worker_id, moved, "Requeued unacknowledged jobs");
    }

    Ok(moved)
}

/// Publish a job result for the grading backend
pub async fn push_result(
    conn: &mut ConnectionManager,
    queue: &str,
    result: &ReportedResult,
) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(encode_err)?;
    conn.lpush::<_, _, ()>(queue, payload).await
}

/// Most recent results first, without consuming them
pub async fn recent_results(
    conn: &mut ConnectionManager,
    queue: &str,
    limit: usize,
) -> RedisResult<Vec<ReportedResult>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let payloads: Vec<String> = conn.lrange(queue, 0, limit as isize - 1).await?;

    Ok(payloads
        .iter()
        .filter_map(|p| match serde_json::from_str(p) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed result payload");
                None
            }
        })
        .collect())
}
