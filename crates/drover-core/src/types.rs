use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_MAX_ATTEMPTS;

/// A queued unit of work as stored in `<schema>_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_queue_id: Option<i64>,
    /// Name of the serial queue this job belongs to, if any.
    pub queue_name: Option<String>,
    pub task_id: i64,
    pub task_identifier: String,
    /// Arbitrary JSON handed to the task. An array marks a batch job.
    pub payload: Value,
    /// Lower runs sooner.
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    /// Incremented when the job is claimed, not when it finishes.
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub flags: BTreeSet<String>,
    pub key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True once the job has used up every attempt; it stays in the table for
    /// inspection but is never claimed again.
    pub fn is_permanently_failed(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// A named serial queue; while locked no other job of the queue is claimable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueue {
    pub id: i64,
    pub queue_name: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

/// How `add_job` treats an existing job with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKeyMode {
    /// Overwrite the pending job's fields. A job that is currently running is
    /// left alone and a fresh job is inserted instead.
    #[default]
    Replace,
    /// Keep the existing job untouched.
    Dedupe,
}

impl fmt::Display for JobKeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKeyMode::Replace => write!(f, "replace"),
            JobKeyMode::Dedupe => write!(f, "dedupe"),
        }
    }
}

impl std::str::FromStr for JobKeyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "replace" => Ok(JobKeyMode::Replace),
            "dedupe" => Ok(JobKeyMode::Dedupe),
            other => Err(format!("unknown job key mode: {other}")),
        }
    }
}

/// Enqueue request. Build with [`NewJob::new`] and the `with_*` setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_identifier: String,
    pub payload: Value,
    pub queue_name: Option<String>,
    /// `None` means "now" as seen by the store.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub priority: i32,
    pub key: Option<String>,
    pub key_mode: JobKeyMode,
    pub flags: BTreeSet<String>,
}

impl NewJob {
    pub fn new(task_identifier: impl Into<String>, payload: Value) -> Self {
        Self {
            task_identifier: task_identifier.into(),
            payload,
            queue_name: None,
            run_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            key: None,
            key_mode: JobKeyMode::default(),
            flags: BTreeSet::new(),
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, mode: JobKeyMode) -> Self {
        self.key = Some(key.into());
        self.key_mode = mode;
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }
}

/// Persisted cron watermark for one schedule identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownCrontab {
    pub identifier: String,
    pub known_since: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
}
