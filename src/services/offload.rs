//! Offload dispatcher: durable queue + background replication workers.
//!
//! The upload path only inserts a job row and wakes the pool; it never
//! waits for the remote copy. Workers claim due jobs, run the multipart
//! upload, and record the outcome on both the job and the file descriptor.
//! Failed attempts are retried with exponential backoff up to
//! `max_attempts`, after which the descriptor is marked `failed`.
//!
//! Shutdown: [`OffloadHandle::shutdown`] stops the claim loop; uploads
//! already running are left to finish on their own tasks.

use crate::{
    models::{
        file::ReplicationStatus,
        offload_job::{JobStatus, OffloadJob, OffloadJobRequest},
    },
    services::{metadata::MetadataStore, remote::RemoteObjectProvider},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::{Notify, Semaphore, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Upper bound on the delay between two attempts of the same job.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// `base * 2^(attempt - 1)`, capped at [`MAX_RETRY_BACKOFF_SECS`].
pub(crate) fn compute_retry_backoff(base: Duration, attempt: i64) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    base.saturating_mul(2_u32.pow(exponent))
        .min(Duration::from_secs(MAX_RETRY_BACKOFF_SECS))
}

#[derive(Clone, Debug)]
pub struct OffloadConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Total upload attempts per job before it is marked failed.
    pub max_attempts: i64,
    pub retry_base: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            poll_interval: Duration::from_millis(1000),
            max_attempts: 5,
            retry_base: Duration::from_secs(2),
        }
    }
}

const JOB_COLUMNS: &str =
    "id, identifier, local_path, remote_key, status, attempts, next_attempt_at, last_error";

/// Publishing side of the queue, shared with the upload path.
#[derive(Clone)]
pub struct OffloadQueue {
    db: SqlitePool,
    notify: Arc<Notify>,
}

impl OffloadQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Persist a pending job and wake the worker pool. Returns the job id.
    pub async fn enqueue(&self, request: OffloadJobRequest) -> sqlx::Result<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO offload_jobs (
                identifier, local_path, remote_key, status, attempts,
                next_attempt_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, 0, ?, ?, ?)
             RETURNING id",
        )
        .bind(&request.identifier)
        .bind(&request.local_path)
        .bind(&request.remote_key)
        .bind(JobStatus::Pending)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        self.notify.notify_one();
        debug!(job_id = id, identifier = %request.identifier, "offload job enqueued");
        Ok(id)
    }

    /// Atomically move the oldest due pending job to `running`.
    pub async fn claim_next(&self) -> sqlx::Result<Option<OffloadJob>> {
        let now = Utc::now();
        sqlx::query_as::<_, OffloadJob>(&format!(
            "UPDATE offload_jobs
             SET status = ?, attempts = attempts + 1, updated_at = ?
             WHERE id = (
                 SELECT id FROM offload_jobs
                 WHERE status = ? AND next_attempt_at <= ?
                 ORDER BY next_attempt_at, id
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobStatus::Running)
        .bind(now)
        .bind(JobStatus::Pending)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.db)
        .await
    }

    pub async fn get(&self, id: i64) -> sqlx::Result<Option<OffloadJob>> {
        sqlx::query_as::<_, OffloadJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM offload_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
    }

    /// Return jobs stranded in `running` (e.g. by a crash) to `pending`.
    pub async fn requeue_interrupted(&self) -> sqlx::Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE offload_jobs SET status = ?, next_attempt_at = ?, updated_at = ?
             WHERE status = ?",
        )
        .bind(JobStatus::Pending)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(JobStatus::Running)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_completed(&self, id: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE offload_jobs SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Completed)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, id: i64, delay: Duration, error: &str) -> sqlx::Result<()> {
        let now = Utc::now();
        let next_attempt_at = now.timestamp_millis() + delay.as_millis() as i64;
        sqlx::query(
            "UPDATE offload_jobs
             SET status = ?, next_attempt_at = ?, last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(JobStatus::Pending)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE offload_jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Failed)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Result of running one claimed job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempt: i64, delay: Duration },
    Failed,
}

/// Consumes the queue and replicates staged files to the remote store.
#[derive(Clone)]
pub struct OffloadWorker {
    queue: OffloadQueue,
    metadata: MetadataStore,
    provider: Arc<dyn RemoteObjectProvider>,
    config: OffloadConfig,
}

impl OffloadWorker {
    pub fn new(
        queue: OffloadQueue,
        metadata: MetadataStore,
        provider: Arc<dyn RemoteObjectProvider>,
        config: OffloadConfig,
    ) -> Self {
        Self {
            queue,
            metadata,
            provider,
            config,
        }
    }

    /// Claim one due job and run it to an outcome on the current task.
    pub async fn process_next(&self) -> sqlx::Result<Option<(OffloadJob, JobOutcome)>> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        let outcome = self.run_job(&job).await;
        Ok(Some((job, outcome)))
    }

    #[tracing::instrument(skip(self, job), fields(job.id = job.id, identifier = %job.identifier))]
    async fn run_job(&self, job: &OffloadJob) -> JobOutcome {
        let local_path = PathBuf::from(&job.local_path);
        let upload = self.provider.upload(&job.remote_key, &local_path).await;

        match upload {
            Ok(()) => {
                if let Err(e) = self.queue.mark_completed(job.id).await {
                    error!(error = %e, "failed to mark offload job completed");
                }
                if let Err(e) = self
                    .metadata
                    .set_replication_status(&job.identifier, ReplicationStatus::Completed)
                    .await
                {
                    error!(error = %e, "failed to record completed replication");
                }
                info!(remote_key = %job.remote_key, attempt = job.attempts, "file offloaded");
                JobOutcome::Completed
            }
            Err(err) if job.attempts < self.config.max_attempts => {
                let delay = compute_retry_backoff(self.config.retry_base, job.attempts);
                warn!(
                    error = %err,
                    attempt = job.attempts,
                    max_attempts = self.config.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "offload attempt failed, will retry"
                );
                if let Err(e) = self.queue.reschedule(job.id, delay, &err.to_string()).await {
                    error!(error = %e, "failed to reschedule offload job");
                }
                JobOutcome::Retrying {
                    attempt: job.attempts,
                    delay,
                }
            }
            Err(err) => {
                error!(
                    error = %err,
                    attempts = job.attempts,
                    "offload failed permanently, file remains local only"
                );
                if let Err(e) = self.queue.mark_failed(job.id, &err.to_string()).await {
                    error!(error = %e, "failed to mark offload job failed");
                }
                if let Err(e) = self
                    .metadata
                    .set_replication_status(&job.identifier, ReplicationStatus::Failed)
                    .await
                {
                    error!(error = %e, "failed to record failed replication");
                }
                JobOutcome::Failed
            }
        }
    }

    /// Start the worker pool on the current runtime.
    pub fn spawn(self) -> OffloadHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(self.worker_pool(shutdown_rx));
        OffloadHandle { shutdown_tx, join }
    }

    async fn worker_pool(self, mut shutdown_rx: mpsc::Receiver<()>) {
        match self.queue.requeue_interrupted().await {
            Ok(0) => {}
            Ok(n) => info!(jobs = n, "requeued interrupted offload jobs"),
            Err(e) => error!(error = %e, "failed to requeue interrupted offload jobs"),
        }

        info!(
            max_workers = self.config.max_workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "offload worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        loop {
            self.claim_and_dispatch(&semaphore).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("offload worker pool shutting down");
                    break;
                }
                _ = self.queue.notify.notified() => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim due jobs while worker slots are free.
    async fn claim_and_dispatch(&self, semaphore: &Arc<Semaphore>) {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("no offload workers available, skipping claim");
                return;
            };

            match self.queue.claim_next().await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.run_job(&job).await;
                    });
                }
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to claim offload job");
                    return;
                }
            }
        }
    }
}

pub struct OffloadHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl OffloadHandle {
    /// Stop claiming new jobs and wait for the claim loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            warn!(error = %e, "offload worker pool task ended abnormally");
        }
    }
}
