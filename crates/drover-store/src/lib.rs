//! `drover-store`: durable job storage behind the [`JobStore`] trait.
//!
//! # Overview
//!
//! Jobs live in `<schema>_jobs`, serial queues in `<schema>_job_queues`, task
//! names are interned in `<schema>_tasks` and cron watermarks are kept in
//! `<schema>_known_crontabs`. Every state transition (claim, complete, fail,
//! stale-lock reset, cron firing) is a single atomic unit, so any number of
//! workers can share one store without further coordination.
//!
//! | Backend            | Use                                          |
//! |--------------------|----------------------------------------------|
//! | [`SqliteJobStore`] | Production: WAL SQLite, bounded pool         |
//! | [`MemoryJobStore`] | Tests and embedding without persistence      |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use drover_core::{Job, JobQueue, KnownCrontab, NewJob};

pub mod backoff;
pub mod db;
pub mod error;
pub mod memory;
pub mod pool;
pub mod sqlite;
pub mod task_ids;

pub use backoff::{backoff, retry_at};
pub use error::{Result, StoreError};
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use task_ids::TaskIdentifierCache;

/// Interned task names: ids to pass to `claim`, plus the reverse mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDetails {
    pub task_ids: Vec<i64>,
    pub identifiers: HashMap<i64, String>,
}

impl TaskDetails {
    pub fn identifier(&self, task_id: i64) -> Option<&str> {
        self.identifiers.get(&task_id).map(String::as_str)
    }
}

/// Rows touched by a stale-lock reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetCounts {
    pub jobs: usize,
    pub queues: usize,
}

/// Job key used for the cron firing of `identifier` at minute `ts`.
pub fn cron_job_key(identifier: &str, ts: DateTime<Utc>) -> String {
    format!("cron:{identifier}:{}", ts.timestamp_millis())
}

/// The job store protocol shared by workers, the cron scheduler and tooling.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Enqueue a job, creating its queue and task rows on demand and honouring
    /// the job key mode.
    async fn add_job(&self, job: NewJob) -> Result<Job>;

    /// Atomically lock and return the next eligible job, if any.
    ///
    /// Eligible: due, unlocked (or stale), attempts left, task supported, no
    /// excluded flag, queue free (or stale). Ordered by priority, run_at, id.
    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[i64],
        excluded_flags: &[String],
    ) -> Result<Option<Job>>;

    /// Delete a finished job and release its queue if this worker holds it.
    async fn complete(&self, worker_id: &str, job: &Job) -> Result<()>;

    /// Unlock a failed job and reschedule it with backoff. A job no longer
    /// locked by `worker_id` is left untouched.
    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<Value>,
    ) -> Result<()>;

    /// Clear job and queue locks older than the stale-lock age.
    async fn reset_stale_locks(&self) -> Result<ResetCounts>;

    /// Ensure every name has a task row and return their ids.
    async fn intern_task_names(&self, names: &[String]) -> Result<TaskDetails>;

    /// Record first sight of each cron identifier (`known_since = now`).
    async fn register_known_crontabs(&self, identifiers: &[String]) -> Result<()>;

    async fn known_crontabs(&self, identifiers: &[String]) -> Result<Vec<KnownCrontab>>;

    /// Advance `identifier`'s watermark to `ts` and enqueue `job` in one unit.
    ///
    /// Returns `None` when the watermark is already at or past `ts`, i.e. this
    /// minute was processed before.
    async fn fire_cron_job(
        &self,
        identifier: &str,
        ts: DateTime<Utc>,
        job: NewJob,
    ) -> Result<Option<Job>>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    async fn job_queues(&self) -> Result<Vec<JobQueue>>;
}

pub(crate) fn validate_new_job(job: &NewJob) -> Result<()> {
    if job.task_identifier.is_empty() {
        return Err(StoreError::InvalidJob("task identifier must not be empty".into()));
    }
    if job.max_attempts < 1 {
        return Err(StoreError::InvalidJob(format!(
            "max_attempts must be at least 1, got {}",
            job.max_attempts
        )));
    }
    if job.key.as_deref() == Some("") {
        return Err(StoreError::InvalidJob("job key must not be empty".into()));
    }
    if job.queue_name.as_deref() == Some("") {
        return Err(StoreError::InvalidJob("queue name must not be empty".into()));
    }
    Ok(())
}
