/// Worker Pool - Queue Consumption
///
/// Claims job requests from the request queue and hands each one to the
/// orchestrator on its own task. At most `max_concurrent_jobs` run at once;
/// a job is only claimed when a slot is free, so unclaimed work stays
/// visible to other workers.
///
/// A delivery is acknowledged after its job has reported. Each worker keeps
/// its claims in its own processing list; one that dies mid-job leaves the
/// delivery there, and requeues it when it starts again under the same id.
/// Claims held by other live workers are never touched.

use crate::orchestrator::JobOrchestrator;
use ::redis::aio::ConnectionManager;
use anyhow::Result;
use async_trait::async_trait;
use stagerun_common::redis::{self, Delivery};
use stagerun_common::types::JobRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Seconds one blocking claim waits before re-checking for shutdown
const CLAIM_TIMEOUT_SECS: f64 = 5.0;

/// Back-off after a transport error
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Source of job deliveries
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn claim(&self, timeout_secs: f64) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Redeliver whatever this worker claimed and never acknowledged
    async fn recover(&self) -> Result<usize>;
}

/// Reliable Redis list queue
pub struct RedisJobQueue {
    conn: ConnectionManager,
    queue: String,
    worker_id: String,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, queue: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            conn,
            queue: queue.into(),
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn claim(&self, timeout_secs: f64) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        Ok(redis::claim_job(&mut conn, &self.queue, &self.worker_id, timeout_secs).await?)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(redis::ack_job(&mut conn, &self.queue, &self.worker_id, delivery).await?)
    }

    async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(redis::requeue_stale(&mut conn, &self.queue, &self.worker_id).await?)
    }
}

/// Runs one parsed job to completion
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, request: JobRequest);
}

#[async_trait]
impl JobHandler for JobOrchestrator {
    async fn handle(&self, request: JobRequest) {
        self.run(request).await
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    slots: Arc<Semaphore>,
    max_concurrent_jobs: usize,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, max_concurrent_jobs: usize) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            queue,
            handler,
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            max_concurrent_jobs,
        }
    }

    /// Consume until `shutdown` flips to true, then wait for in-flight jobs
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(max_concurrent_jobs = self.max_concurrent_jobs, "Worker pool started");

        match self.queue.recover().await {
            Ok(0) => {}
            Ok(moved) => info!(moved, "Redelivered jobs left over from a previous run"),
            Err(e) => error!(error = %format!("{:#}", e), "Failed to requeue unacknowledged jobs"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // An abandoned claim stays in this worker's processing list
            // until the next startup requeues it
            let claimed = tokio::select! {
                claimed = self.queue.claim(CLAIM_TIMEOUT_SECS) => claimed,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match claimed {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Failed to claim job");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                process(queue.as_ref(), handler.as_ref(), delivery).await;
                drop(permit);
            });
        }

        info!("Shutdown requested, waiting for in-flight jobs");
        self.drain().await;
        info!("Worker pool stopped");
    }

    async fn drain(&self) {
        match self.slots.acquire_many(self.max_concurrent_jobs as u32).await {
            Ok(_all) => debug!("All job slots released"),
            Err(e) => warn!(error = %e, "Job slots closed while draining"),
        }
    }
}

async fn process(queue: &dyn JobQueue, handler: &dyn JobHandler, delivery: Delivery) {
    match delivery.parse() {
        Ok(request) => {
            debug!(commit_sha = %request.commit_sha, "Claimed job");
            handler.handle(request).await;
        }
        // Nothing to report against, so the payload is dropped
        Err(e) => {
            warn!(error = %e, payload = %delivery.payload, "Discarding malformed job payload");
        }
    }

    if let Err(e) = queue.ack(&delivery).await {
        warn!(error = %format!("{:#}", e), "Failed to acknowledge job");
    }
}
