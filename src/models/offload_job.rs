//! Durable record of one pending replication to remote storage.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of an offload job in the queue.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A queued offload of a staged file.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct OffloadJob {
    /// Queue-assigned row id.
    pub id: i64,

    /// Identifier of the file descriptor this job replicates.
    pub identifier: String,

    /// Local staging path at the time the job was enqueued.
    pub local_path: String,

    /// Object key in the remote bucket.
    pub remote_key: String,

    pub status: JobStatus,

    /// Number of upload attempts claimed so far (including a running one).
    pub attempts: i64,

    /// Earliest time, in unix milliseconds, the job may be claimed.
    pub next_attempt_at: i64,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

/// What the dispatcher publishes for a freshly staged file.
#[derive(Clone, Debug)]
pub struct OffloadJobRequest {
    pub identifier: String,
    pub local_path: String,
    pub remote_key: String,
}
